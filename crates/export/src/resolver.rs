//! Beneficiary resolution
//!
//! Picks the population snapshot an export should use and, for diff-mode
//! requests, splits its members into those new since the client's last
//! export and those already seen.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::model::Since;
use crate::population::{
    ImportStatus, MemberRecord, PopulationRepository, Snapshot, CATEGORY_ATTRIBUTION,
};

/// Members of the current snapshot, partitioned against a prior snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Members absent from the prior snapshot
    pub new: Vec<MemberRecord>,
    /// Members present in the prior snapshot
    pub existing: Vec<MemberRecord>,
}

impl Resolution {
    pub fn len(&self) -> usize {
        self.new.len() + self.existing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.existing.is_empty()
    }
}

/// Resolves the beneficiaries an organization's export covers
pub struct BeneficiaryResolver {
    repository: Arc<dyn PopulationRepository>,
    snapshot_cutoff: Duration,
    suppression_lookback_days: u32,
}

impl BeneficiaryResolver {
    pub fn new(repository: Arc<dyn PopulationRepository>, config: &ExportConfig) -> Self {
        Self {
            repository,
            snapshot_cutoff: config.snapshot_cutoff,
            suppression_lookback_days: config.suppression_lookback_days,
        }
    }

    /// Members of the current snapshot, classified against the latest
    /// snapshot imported at or before `since`
    ///
    /// With no such prior snapshot every member is new.
    #[instrument(skip(self), fields(since = %since.as_str()))]
    pub async fn resolve(&self, org_id: &str, since: &Since) -> Result<Resolution, ExportError> {
        let current = self.current_snapshot(org_id).await?;
        let members = self.unsuppressed_members(current.id).await?;

        let prior = self
            .repository
            .get_latest_snapshot(
                org_id,
                CATEGORY_ATTRIBUTION,
                ImportStatus::Completed,
                None,
                Some(since.instant()),
            )
            .await?;

        let resolution = match prior {
            None => {
                debug!(org_id, "no snapshot before since, all members are new");
                Resolution {
                    new: members,
                    existing: vec![],
                }
            }
            Some(prior) => {
                let seen: HashSet<String> = self
                    .repository
                    .get_member_identifiers(prior.id)
                    .await?
                    .into_iter()
                    .collect();
                let (existing, new) = members
                    .into_iter()
                    .partition(|m| seen.contains(&m.member_id));
                Resolution { new, existing }
            }
        };

        if resolution.is_empty() {
            return Err(ExportError::EmptyResult {
                org_id: org_id.to_string(),
                snapshot_id: current.id,
            });
        }

        info!(
            org_id,
            snapshot_id = current.id,
            new = resolution.new.len(),
            existing = resolution.existing.len(),
            "resolved beneficiaries"
        );
        Ok(resolution)
    }

    /// Every unsuppressed member of the current snapshot
    #[instrument(skip(self))]
    pub async fn resolve_all(&self, org_id: &str) -> Result<Vec<MemberRecord>, ExportError> {
        let current = self.current_snapshot(org_id).await?;
        let members = self.unsuppressed_members(current.id).await?;

        if members.is_empty() {
            return Err(ExportError::EmptyResult {
                org_id: org_id.to_string(),
                snapshot_id: current.id,
            });
        }

        info!(
            org_id,
            snapshot_id = current.id,
            members = members.len(),
            "resolved beneficiaries"
        );
        Ok(members)
    }

    /// Import times after this are too fresh to export from
    fn cutoff(&self) -> Option<DateTime<Utc>> {
        if self.snapshot_cutoff.is_zero() {
            return None;
        }
        let cutoff = chrono::Duration::from_std(self.snapshot_cutoff).unwrap_or_default();
        Some(Utc::now() - cutoff)
    }

    async fn current_snapshot(&self, org_id: &str) -> Result<Snapshot, ExportError> {
        let cutoff = self.cutoff();
        self.repository
            .get_latest_snapshot(
                org_id,
                CATEGORY_ATTRIBUTION,
                ImportStatus::Completed,
                None,
                cutoff,
            )
            .await?
            .ok_or_else(|| ExportError::NoSnapshot {
                org_id: org_id.to_string(),
                cutoff,
            })
    }

    async fn unsuppressed_members(&self, snapshot_id: i64) -> Result<Vec<MemberRecord>, ExportError> {
        let suppressed = self
            .repository
            .get_suppressed_identifiers(self.suppression_lookback_days)
            .await?;
        if !suppressed.is_empty() {
            debug!(count = suppressed.len(), "excluding suppressed members");
        }
        Ok(self.repository.get_members(snapshot_id, &suppressed).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::population::{InMemoryPopulationRepository, SharingPreference};

    fn hours_ago(hours: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(hours)
    }

    fn ids(members: &[MemberRecord]) -> Vec<&str> {
        members.iter().map(|m| m.member_id.as_str()).collect()
    }

    fn resolver(repo: Arc<InMemoryPopulationRepository>, config: ExportConfig) -> BeneficiaryResolver {
        BeneficiaryResolver::new(repo, &config)
    }

    #[tokio::test]
    async fn test_no_prior_snapshot_means_all_new() {
        let repo = Arc::new(InMemoryPopulationRepository::new());
        repo.insert_snapshot("A9994", hours_ago(1), ["1", "2", "3"]);
        let since = Since::parse("2020-02-13T08:00:00.000-05:00").unwrap();

        let resolution = resolver(repo, ExportConfig::default())
            .resolve("A9994", &since)
            .await
            .unwrap();
        assert_eq!(ids(&resolution.new), vec!["1", "2", "3"]);
        assert!(resolution.existing.is_empty());
    }

    #[tokio::test]
    async fn test_diff_against_prior_snapshot() {
        let repo = Arc::new(InMemoryPopulationRepository::new());
        repo.insert_snapshot("A9994", hours_ago(72), ["1", "2"]);
        repo.insert_snapshot("A9994", hours_ago(1), ["1", "2", "3", "4"]);
        let since = Since::parse(&hours_ago(24).to_rfc3339()).unwrap();

        let resolution = resolver(repo, ExportConfig::default())
            .resolve("A9994", &since)
            .await
            .unwrap();
        assert_eq!(ids(&resolution.new), vec!["3", "4"]);
        assert_eq!(ids(&resolution.existing), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_suppressed_members_are_dropped() {
        let repo = Arc::new(InMemoryPopulationRepository::new());
        repo.insert_snapshot("A9994", hours_ago(1), ["1", "2", "3"]);
        repo.insert_suppression("2", Utc::now().date_naive(), SharingPreference::OptOut);

        let members = resolver(repo, ExportConfig::default())
            .resolve_all("A9994")
            .await
            .unwrap();
        assert_eq!(ids(&members), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_an_error() {
        let repo = Arc::new(InMemoryPopulationRepository::new());
        let result = resolver(repo, ExportConfig::default())
            .resolve_all("A9994")
            .await;
        assert!(matches!(result, Err(ExportError::NoSnapshot { .. })));
    }

    #[tokio::test]
    async fn test_cutoff_skips_fresh_snapshots() {
        let repo = Arc::new(InMemoryPopulationRepository::new());
        repo.insert_snapshot("A9994", hours_ago(48), ["old"]);
        repo.insert_snapshot("A9994", hours_ago(1), ["fresh"]);
        let config = ExportConfig::default().with_snapshot_cutoff(Duration::from_secs(12 * 3600));

        let members = resolver(repo.clone(), config).resolve_all("A9994").await.unwrap();
        assert_eq!(ids(&members), vec!["old"]);

        let config = ExportConfig::default().with_snapshot_cutoff(Duration::from_secs(72 * 3600));
        let result = resolver(repo, config).resolve_all("A9994").await;
        assert!(matches!(
            result,
            Err(ExportError::NoSnapshot { cutoff: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_fully_suppressed_population_is_empty_result() {
        let repo = Arc::new(InMemoryPopulationRepository::new());
        repo.insert_snapshot("A9994", hours_ago(1), ["1"]);
        repo.insert_suppression("1", Utc::now().date_naive(), SharingPreference::OptOut);
        let since = Since::parse("2020-02-13T08:00:00.000-05:00").unwrap();

        let result = resolver(repo, ExportConfig::default())
            .resolve("A9994", &since)
            .await;
        assert!(matches!(result, Err(ExportError::EmptyResult { .. })));
    }
}
