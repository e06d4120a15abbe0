//! Execution of one leased work unit

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::ClientRegistry;
use crate::model::{is_supported_org, JobStatus, ResourceType};
use crate::output::{
    artifact_name, error_artifact_name, job_dir, ndjson_entries, ArtifactArbiter,
    OperationOutcome, OutputError,
};
use crate::persistence::{CompletionMarker, JobStore, StoreError};
use crate::queue::LeasedUnit;
use crate::splitter::WorkUnit;

/// Unit-level failures
///
/// Any of these fails the whole attempt and hands the unit back to the
/// queue. Per-member failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("malformed work unit: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid organization identifier: {0}")]
    InvalidOrganization(String),

    #[error("no retrieval client for {0}")]
    MissingClient(ResourceType),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("output error: {0}")]
    Output(#[from] OutputError),
}

/// What a finished unit did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit_id: Uuid,
    pub job_id: Uuid,
    pub resource_type: ResourceType,
    pub members: usize,
    /// Result lines appended to the artifact
    pub entries_written: usize,
    /// Members recorded in the error artifact
    pub member_failures: usize,
    /// The job had already failed or been archived; nothing was done
    pub skipped: bool,
}

/// Runs work units against the retrieval clients
pub struct UnitProcessor {
    jobs: Arc<dyn JobStore>,
    clients: ClientRegistry,
    arbiter: Arc<ArtifactArbiter>,
    payload_dir: PathBuf,
}

impl UnitProcessor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        clients: ClientRegistry,
        arbiter: Arc<ArtifactArbiter>,
        payload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            jobs,
            clients,
            arbiter,
            payload_dir: payload_dir.into(),
        }
    }

    /// Process one leased unit
    ///
    /// Validation and retrieval happen before any output is written. Each
    /// artifact then gets one whole append, in member order.
    #[instrument(skip(self, leased), fields(unit_id = %leased.id, job_id = %leased.job_id, attempt = leased.attempt))]
    pub async fn process(&self, leased: &LeasedUnit) -> Result<UnitReport, ProcessError> {
        let unit: WorkUnit = serde_json::from_value(leased.payload.clone())?;

        if !is_supported_org(&unit.org_id) {
            return Err(ProcessError::InvalidOrganization(unit.org_id));
        }
        let client = self
            .clients
            .get(unit.resource_type)
            .ok_or(ProcessError::MissingClient(unit.resource_type))?;

        let mut report = UnitReport {
            unit_id: leased.id,
            job_id: unit.job_id,
            resource_type: unit.resource_type,
            members: unit.member_ids.len(),
            entries_written: 0,
            member_failures: 0,
            skipped: false,
        };

        let job = self.jobs.get_job(unit.job_id).await?;
        if matches!(job.status, JobStatus::Failed | JobStatus::Archived) {
            debug!(status = %job.status, "job is no longer active, skipping unit");
            report.skipped = true;
            return Ok(report);
        }

        if self
            .jobs
            .transition_status(job.id, &[JobStatus::Pending], JobStatus::InProgress)
            .await?
        {
            info!(job_id = %job.id, "job in progress");
        }

        let file_name = artifact_name(&unit.org_id, unit.resource_type);
        let dir = job_dir(&self.payload_dir, unit.job_id);
        let data_path = dir.join(&file_name);
        let error_path = dir.join(error_artifact_name(&unit.org_id, unit.resource_type));

        // Buffered so a failed attempt leaves no per-member fragments behind
        let mut data_lines = Vec::new();
        let mut error_lines = Vec::new();

        for member_id in &unit.member_ids {
            let outcome = match client
                .fetch_resource(unit.resource_type, member_id, unit.since_filter())
                .await
            {
                Ok(payload) => match ndjson_entries(&payload) {
                    Ok(lines) => {
                        data_lines.extend(lines);
                        continue;
                    }
                    Err(e) => {
                        warn!(member_id, "Unreadable upstream payload: {}", e);
                        OperationOutcome::payload_unreadable(
                            unit.resource_type,
                            member_id,
                            &unit.org_id,
                        )
                    }
                },
                Err(e) => {
                    warn!(member_id, "Retrieval failed: {}", e);
                    OperationOutcome::retrieval_failed(unit.resource_type, member_id, &unit.org_id)
                }
            };

            report.member_failures += 1;
            error_lines.push(outcome.to_line().map_err(OutputError::from)?);
        }

        report.entries_written = data_lines.len();
        self.arbiter.append(&error_path, error_lines).await?;
        self.arbiter.append(&data_path, data_lines).await?;

        self.jobs
            .record_marker(CompletionMarker::new(unit.job_id, leased.id, file_name))
            .await?;

        info!(
            resource_type = %unit.resource_type,
            members = report.members,
            entries = report.entries_written,
            failures = report.member_failures,
            "work unit finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, ResourceClient};
    use crate::model::ExportJob;
    use crate::persistence::InMemoryJobStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    /// Returns a two-entry bundle, fails for ids starting with "bad", and
    /// returns garbage for ids starting with "junk"
    struct ScriptedClient;

    #[async_trait]
    impl ResourceClient for ScriptedClient {
        async fn fetch_resource(
            &self,
            resource_type: ResourceType,
            member_id: &str,
            _since: Option<&str>,
        ) -> Result<String, ClientError> {
            if member_id.starts_with("bad") {
                return Err(ClientError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            if member_id.starts_with("junk") {
                return Ok("<html>".to_string());
            }
            Ok(json!({
                "resourceType": "Bundle",
                "entry": [
                    {"resource": {"resourceType": resource_type.as_str(), "id": format!("{member_id}-1")}},
                    {"resource": {"resourceType": resource_type.as_str(), "id": format!("{member_id}-2")}}
                ]
            })
            .to_string())
        }
    }

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        processor: UnitProcessor,
        dir: tempfile::TempDir,
    }

    fn fixture(clients: ClientRegistry) -> Fixture {
        let jobs = Arc::new(InMemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let processor = UnitProcessor::new(
            jobs.clone(),
            clients,
            Arc::new(ArtifactArbiter::new()),
            dir.path(),
        );
        Fixture {
            jobs,
            processor,
            dir,
        }
    }

    fn leased(job: &ExportJob, members: &[&str]) -> LeasedUnit {
        let unit = WorkUnit {
            job_id: job.id,
            org_id: job.org_id.clone(),
            resource_type: ResourceType::Patient,
            since: String::new(),
            member_ids: members.iter().map(|m| m.to_string()).collect(),
            priority: 20,
        };
        LeasedUnit {
            id: Uuid::now_v7(),
            job_id: job.id,
            payload: serde_json::to_value(unit).unwrap(),
            priority: 20,
            attempt: 1,
            max_attempts: 3,
            lease_expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_member_failures_are_isolated() {
        let f = fixture(ClientRegistry::uniform(Arc::new(ScriptedClient)));
        let job = ExportJob::new("A9994", "/api/v1/Patient/$export");
        f.jobs.create_job(&job).await.unwrap();
        f.jobs.set_job_count(job.id, 1).await.unwrap();

        let unit = leased(&job, &["1", "bad-2", "3", "junk-4"]);
        let report = f.processor.process(&unit).await.unwrap();

        assert_eq!(report.entries_written, 4);
        assert_eq!(report.member_failures, 2);
        assert!(!report.skipped);

        let job_dir = f.dir.path().join(job.id.to_string());
        let data = std::fs::read_to_string(job_dir.join("A9994-Patient.ndjson")).unwrap();
        let ids: Vec<String> = data
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["resource"]["id"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(ids, vec!["1-1", "1-2", "3-1", "3-2"]);

        let errors = std::fs::read_to_string(job_dir.join("A9994-Patient-error.ndjson")).unwrap();
        let outcomes: Vec<OperationOutcome> = errors
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].detail_code, crate::output::RETRIEVAL_ERROR);
        assert_eq!(outcomes[1].detail_code, crate::output::INTERNAL_ERROR);

        let stored = f.jobs.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
        assert_eq!(f.jobs.count_markers(job.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_org_fails_before_output() {
        let f = fixture(ClientRegistry::uniform(Arc::new(ScriptedClient)));
        let job = ExportJob::new("not-an-org", "/api/v1/Patient/$export");
        f.jobs.create_job(&job).await.unwrap();

        let result = f.processor.process(&leased(&job, &["1"])).await;
        assert!(matches!(result, Err(ProcessError::InvalidOrganization(_))));
        assert!(!f.dir.path().join(job.id.to_string()).exists());
        assert_eq!(f.jobs.get_job(job.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_client_is_unit_failure() {
        let f = fixture(ClientRegistry::new());
        let job = ExportJob::new("A9994", "/api/v1/Patient/$export");
        f.jobs.create_job(&job).await.unwrap();

        let result = f.processor.process(&leased(&job, &["1"])).await;
        assert!(matches!(
            result,
            Err(ProcessError::MissingClient(ResourceType::Patient))
        ));
        assert_eq!(f.jobs.count_markers(job.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_is_skipped() {
        let f = fixture(ClientRegistry::uniform(Arc::new(ScriptedClient)));
        let job = ExportJob::new("A9994", "/api/v1/Patient/$export");
        f.jobs.create_job(&job).await.unwrap();
        f.jobs.force_status(job.id, JobStatus::Failed);

        let report = f.processor.process(&leased(&job, &["1"])).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.entries_written, 0);
        assert_eq!(f.jobs.count_markers(job.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let f = fixture(ClientRegistry::uniform(Arc::new(ScriptedClient)));
        let job = ExportJob::new("A9994", "/api/v1/Patient/$export");
        let mut unit = leased(&job, &["1"]);
        unit.payload = json!({"job_id": "nope"});

        let result = f.processor.process(&unit).await;
        assert!(matches!(result, Err(ProcessError::Payload(_))));
    }

    #[tokio::test]
    async fn test_output_failure_then_retry_writes_each_member_once() {
        let f = fixture(ClientRegistry::uniform(Arc::new(ScriptedClient)));
        let job = ExportJob::new("A9994", "/api/v1/Patient/$export");
        f.jobs.create_job(&job).await.unwrap();
        f.jobs.set_job_count(job.id, 1).await.unwrap();

        // A directory in place of the error artifact makes its append fail
        let job_dir = f.dir.path().join(job.id.to_string());
        let error_path = job_dir.join("A9994-Patient-error.ndjson");
        std::fs::create_dir_all(&error_path).unwrap();

        let mut unit = leased(&job, &["1", "bad-2", "3"]);
        let result = f.processor.process(&unit).await;
        assert!(matches!(result, Err(ProcessError::Output(_))));
        assert!(!job_dir.join("A9994-Patient.ndjson").exists());
        assert_eq!(f.jobs.count_markers(job.id).await.unwrap(), 0);

        std::fs::remove_dir(&error_path).unwrap();
        unit.attempt = 2;
        let report = f.processor.process(&unit).await.unwrap();
        assert_eq!(report.entries_written, 4);
        assert_eq!(report.member_failures, 1);

        let data = std::fs::read_to_string(job_dir.join("A9994-Patient.ndjson")).unwrap();
        let ids: Vec<String> = data
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["resource"]["id"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(ids, vec!["1-1", "1-2", "3-1", "3-2"]);

        let errors = std::fs::read_to_string(&error_path).unwrap();
        assert_eq!(errors.lines().count(), 1);
        assert_eq!(f.jobs.count_markers(job.id).await.unwrap(), 1);
    }
}
