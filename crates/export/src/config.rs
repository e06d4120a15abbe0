//! Pipeline configuration
//!
//! Values only; the worker binary decides where they come from (normally
//! [`ExportConfig::from_env`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::ResourceType;
use crate::reliability::RetryPolicy;

/// Batch quota and queue priority for one resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    /// Maximum members per work unit
    pub max_batch_size: usize,

    /// Queue priority (lower is dequeued earlier)
    pub base_priority: i16,

    /// Priority used instead of `base_priority` when the request carries a
    /// `since` filter
    pub since_priority: Option<i16>,
}

impl ResourceQuota {
    pub fn new(max_batch_size: usize, base_priority: i16) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            base_priority,
            since_priority: None,
        }
    }

    pub fn with_since_priority(mut self, priority: i16) -> Self {
        self.since_priority = Some(priority);
        self
    }
}

/// Configuration consumed by the resolver, splitter, and worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Per-resource-type batch quotas and priorities
    pub quotas: HashMap<ResourceType, ResourceQuota>,

    /// Organizations expedited through the queue
    pub priority_orgs: Vec<String>,

    /// Priority given to every unit of an allow-listed organization
    pub expedited_priority: i16,

    /// Snapshots newer than `now - cutoff` are not used (zero disables)
    #[serde(with = "duration_millis")]
    pub snapshot_cutoff: Duration,

    /// Suppression entries older than this many days are ignored
    pub suppression_lookback_days: u32,

    /// Queue-level retry policy for unit failures
    pub retry_policy: RetryPolicy,

    /// Root directory for output artifacts
    pub payload_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        let quotas = HashMap::from([
            (ResourceType::Patient, ResourceQuota::new(5000, 20)),
            (ResourceType::Coverage, ResourceQuota::new(4000, 20)),
            (
                ResourceType::ExplanationOfBenefit,
                ResourceQuota::new(200, 100).with_since_priority(30),
            ),
        ]);

        Self {
            quotas,
            priority_orgs: vec![],
            expedited_priority: 10,
            snapshot_cutoff: Duration::ZERO,
            suppression_lookback_days: 60,
            retry_policy: RetryPolicy::default(),
            payload_dir: PathBuf::from("./data"),
        }
    }
}

impl ExportConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `MAX_RECORDS_PATIENT`, `MAX_RECORDS_COVERAGE`, `MAX_RECORDS_EOB`: batch quotas
    /// - `PRIORITY_ORG_IDS`: comma-separated expedited organizations
    /// - `EXPEDITED_PRIORITY`: priority for expedited organizations
    /// - `SNAPSHOT_CUTOFF_HOURS`: snapshot staleness cutoff
    /// - `SUPPRESSION_LOOKBACK_DAYS`: suppression lookback window
    /// - `UNIT_MAX_ATTEMPTS`: attempts per work unit before the job fails
    /// - `PAYLOAD_DIR`: artifact root directory
    pub fn from_env() -> Self {
        let mut config = Self::default();

        for (rt, var) in [
            (ResourceType::Patient, "MAX_RECORDS_PATIENT"),
            (ResourceType::Coverage, "MAX_RECORDS_COVERAGE"),
            (ResourceType::ExplanationOfBenefit, "MAX_RECORDS_EOB"),
        ] {
            if let Some(max) = env_parse::<usize>(var) {
                config = config.with_max_batch_size(rt, max);
            }
        }

        if let Ok(orgs) = std::env::var("PRIORITY_ORG_IDS") {
            config.priority_orgs = orgs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(p) = env_parse("EXPEDITED_PRIORITY") {
            config.expedited_priority = p;
        }
        if let Some(hours) = env_parse::<u64>("SNAPSHOT_CUTOFF_HOURS") {
            config.snapshot_cutoff = Duration::from_secs(hours * 3600);
        }
        if let Some(days) = env_parse("SUPPRESSION_LOOKBACK_DAYS") {
            config.suppression_lookback_days = days;
        }
        if let Some(attempts) = env_parse("UNIT_MAX_ATTEMPTS") {
            config.retry_policy = config.retry_policy.with_max_attempts(attempts);
        }
        if let Ok(dir) = std::env::var("PAYLOAD_DIR") {
            config.payload_dir = PathBuf::from(dir);
        }

        config
    }

    /// Quota for a resource type, falling back to a conservative default
    pub fn quota(&self, resource_type: ResourceType) -> ResourceQuota {
        self.quotas
            .get(&resource_type)
            .copied()
            .unwrap_or_else(|| ResourceQuota::new(200, 100))
    }

    pub fn max_batch_size(&self, resource_type: ResourceType) -> usize {
        self.quota(resource_type).max_batch_size.max(1)
    }

    pub fn is_priority_org(&self, org_id: &str) -> bool {
        self.priority_orgs.iter().any(|o| o == org_id)
    }

    pub fn with_max_batch_size(mut self, resource_type: ResourceType, max: usize) -> Self {
        let quota = self.quota(resource_type);
        self.quotas.insert(
            resource_type,
            ResourceQuota {
                max_batch_size: max.max(1),
                ..quota
            },
        );
        self
    }

    pub fn with_quota(mut self, resource_type: ResourceType, quota: ResourceQuota) -> Self {
        self.quotas.insert(resource_type, quota);
        self
    }

    pub fn with_priority_orgs<I, S>(mut self, orgs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_orgs = orgs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_snapshot_cutoff(mut self, cutoff: Duration) -> Self {
        self.snapshot_cutoff = cutoff;
        self
    }

    pub fn with_suppression_lookback_days(mut self, days: u32) -> Self {
        self.suppression_lookback_days = days;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_payload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.payload_dir = dir.into();
        self
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.trim().parse().ok())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quotas() {
        let config = ExportConfig::default();
        assert_eq!(config.max_batch_size(ResourceType::Patient), 5000);
        assert_eq!(config.max_batch_size(ResourceType::Coverage), 4000);
        assert_eq!(config.max_batch_size(ResourceType::ExplanationOfBenefit), 200);
        assert_eq!(config.quota(ResourceType::Patient).base_priority, 20);
        assert_eq!(
            config.quota(ResourceType::ExplanationOfBenefit).since_priority,
            Some(30)
        );
        assert_eq!(config.expedited_priority, 10);
        assert_eq!(config.snapshot_cutoff, Duration::ZERO);
    }

    #[test]
    fn test_config_builder() {
        let config = ExportConfig::default()
            .with_max_batch_size(ResourceType::ExplanationOfBenefit, 15)
            .with_priority_orgs(["A9990", "A9994"])
            .with_suppression_lookback_days(30);

        assert_eq!(config.max_batch_size(ResourceType::ExplanationOfBenefit), 15);
        // Priority settings survive a quota override
        assert_eq!(
            config.quota(ResourceType::ExplanationOfBenefit).base_priority,
            100
        );
        assert!(config.is_priority_org("A9994"));
        assert!(!config.is_priority_org("A9995"));
        assert_eq!(config.suppression_lookback_days, 30);
    }

    #[test]
    fn test_zero_quota_is_clamped() {
        let config = ExportConfig::default().with_max_batch_size(ResourceType::Patient, 0);
        assert_eq!(config.max_batch_size(ResourceType::Patient), 1);
    }

    #[test]
    fn test_serialization() {
        let config = ExportConfig::default().with_snapshot_cutoff(Duration::from_secs(3600));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ExportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.snapshot_cutoff, Duration::from_secs(3600));
        assert_eq!(parsed.quotas, config.quotas);
    }
}
