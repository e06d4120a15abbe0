//! Per-beneficiary retrieval clients
//!
//! The upstream clinical-data service is slow and fallible. Workers call it
//! once per member and never retry on their own; retries happen at the
//! queue level for whole units.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::model::ResourceType;

const FHIR_JSON: &str = "application/fhir+json";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("invalid upstream URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

/// Fetches one member's resources of one type from upstream
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    /// Return the raw bundle payload for `member_id`
    ///
    /// `since` is an upstream `_lastUpdated` filter such as
    /// `gt2020-02-13T08:00:00.000-05:00`.
    async fn fetch_resource(
        &self,
        resource_type: ResourceType,
        member_id: &str,
        since: Option<&str>,
    ) -> Result<String, ClientError>;
}

/// HTTP implementation of [`ResourceClient`]
///
/// Issues `GET {base}/{ResourceType}?patient={member_id}[&_lastUpdated={since}]`.
pub struct HttpResourceClient {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpResourceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Self::with_client(base_url, http)
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self, ClientError> {
        // A trailing slash makes `join` append rather than replace the last segment
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        Ok(Self { base_url, http })
    }

    fn resource_url(
        &self,
        resource_type: ResourceType,
        member_id: &str,
        since: Option<&str>,
    ) -> Result<Url, ClientError> {
        let mut url = self.base_url.join(resource_type.as_str())?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("patient", member_id);
            if let Some(since) = since {
                query.append_pair("_lastUpdated", since);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    #[instrument(skip(self), fields(resource_type = %resource_type))]
    async fn fetch_resource(
        &self,
        resource_type: ResourceType,
        member_id: &str,
        since: Option<&str>,
    ) -> Result<String, ClientError> {
        let url = self.resource_url(resource_type, member_id, since)?;
        let response = self.http.get(url).header(ACCEPT, FHIR_JSON).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        debug!(bytes = body.len(), "fetched upstream resource");
        Ok(body)
    }
}

/// Retrieval clients keyed by resource type
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<ResourceType, Arc<dyn ResourceClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one client for every resource type
    pub fn uniform(client: Arc<dyn ResourceClient>) -> Self {
        let mut registry = Self::new();
        for rt in ResourceType::ALL {
            registry.register(rt, Arc::clone(&client));
        }
        registry
    }

    pub fn register(&mut self, resource_type: ResourceType, client: Arc<dyn ResourceClient>) {
        self.clients.insert(resource_type, client);
    }

    pub fn with_client(mut self, resource_type: ResourceType, client: Arc<dyn ResourceClient>) -> Self {
        self.register(resource_type, client);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<Arc<dyn ResourceClient>> {
        self.clients.get(&resource_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_builds_fhir_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/fhir/ExplanationOfBenefit"))
            .and(query_param("patient", "10000"))
            .and(query_param("_lastUpdated", "gt2020-02-13T08:00:00.000-05:00"))
            .and(header("accept", FHIR_JSON))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"entry":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpResourceClient::new(
            &format!("{}/v1/fhir", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let body = client
            .fetch_resource(
                ResourceType::ExplanationOfBenefit,
                "10000",
                Some("gt2020-02-13T08:00:00.000-05:00"),
            )
            .await
            .unwrap();
        assert_eq!(body, r#"{"entry":[]}"#);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Patient"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = HttpResourceClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .fetch_resource(ResourceType::Patient, "10000", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 503, ref body } if body == "unavailable"));
    }

    #[test]
    fn test_resource_url_without_since() {
        let client = HttpResourceClient::with_client("http://upstream/v2/fhir/", reqwest::Client::new())
            .unwrap();
        let url = client
            .resource_url(ResourceType::Coverage, "1 2", None)
            .unwrap();
        assert_eq!(url.as_str(), "http://upstream/v2/fhir/Coverage?patient=1+2");
    }

    #[test]
    fn test_registry_lookup() {
        let client: Arc<dyn ResourceClient> = Arc::new(
            HttpResourceClient::with_client("http://upstream", reqwest::Client::new()).unwrap(),
        );
        let registry = ClientRegistry::new().with_client(ResourceType::Patient, client.clone());
        assert!(registry.get(ResourceType::Patient).is_some());
        assert!(registry.get(ResourceType::Coverage).is_none());
        assert!(ClientRegistry::uniform(client).get(ResourceType::Coverage).is_some());
    }
}
