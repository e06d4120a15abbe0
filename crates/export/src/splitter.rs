//! Job splitting and priority assignment
//!
//! Turns one export job into bounded-size work units, one resource type at
//! a time, in the order the caller asked for the types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::model::{ExportJob, ResourceType, Since};
use crate::population::MemberRecord;
use crate::resolver::BeneficiaryResolver;

/// One schedulable batch of members for one resource type
///
/// This is the queued payload; workers deserialize it on lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub job_id: Uuid,
    pub org_id: String,
    pub resource_type: ResourceType,
    /// Upstream change filter: empty for full retrieval, `gt<instant>` otherwise
    #[serde(default)]
    pub since: String,
    pub member_ids: Vec<String>,
    pub priority: i16,
}

impl WorkUnit {
    pub fn since_filter(&self) -> Option<&str> {
        if self.since.is_empty() {
            None
        } else {
            Some(&self.since)
        }
    }
}

/// Split `members` into consecutive chunks of at most `size`
///
/// Input order is preserved and only the final chunk may be short.
pub fn chunk_members<T: Clone>(members: &[T], size: usize) -> Vec<Vec<T>> {
    members.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

/// Splits export jobs into prioritized work units
pub struct JobSplitter {
    resolver: Arc<BeneficiaryResolver>,
    config: ExportConfig,
}

impl JobSplitter {
    pub fn new(resolver: Arc<BeneficiaryResolver>, config: ExportConfig) -> Self {
        Self { resolver, config }
    }

    /// Queue priority for an organization's units of one resource type
    ///
    /// Allow-listed organizations always get the expedited priority.
    pub fn priority(&self, org_id: &str, resource_type: ResourceType, has_since: bool) -> i16 {
        if self.config.is_priority_org(org_id) {
            return self.config.expedited_priority;
        }
        let quota = self.config.quota(resource_type);
        match quota.since_priority {
            Some(p) if has_since => p,
            _ => quota.base_priority,
        }
    }

    /// Produce the work units for `job`
    ///
    /// In diff mode, the batches of new members (full retrieval) for every
    /// type come first, then the batches of existing members (filtered by
    /// `since`). Each group follows the requested type order.
    #[instrument(skip(self, job), fields(job_id = %job.id, org_id = %job.org_id))]
    pub async fn split(
        &self,
        job: &ExportJob,
        resource_types: &[ResourceType],
        since: Option<&Since>,
        diff: bool,
    ) -> Result<Vec<WorkUnit>, ExportError> {
        let mut units = Vec::new();

        if diff {
            let since = since.ok_or(ExportError::MissingSince)?;
            let resolution = self.resolver.resolve(&job.org_id, since).await?;
            let filter = since.filter();

            for &resource_type in resource_types {
                let priority = self.priority(&job.org_id, resource_type, true);
                self.push_batches(&mut units, job, resource_type, &resolution.new, "", priority);
            }
            for &resource_type in resource_types {
                let priority = self.priority(&job.org_id, resource_type, true);
                self.push_batches(
                    &mut units,
                    job,
                    resource_type,
                    &resolution.existing,
                    &filter,
                    priority,
                );
            }
        } else {
            let members = self.resolver.resolve_all(&job.org_id).await?;

            for &resource_type in resource_types {
                let priority = self.priority(&job.org_id, resource_type, since.is_some());
                self.push_batches(&mut units, job, resource_type, &members, "", priority);
            }
        }

        debug!(units = units.len(), "split job into work units");
        Ok(units)
    }

    fn push_batches(
        &self,
        units: &mut Vec<WorkUnit>,
        job: &ExportJob,
        resource_type: ResourceType,
        members: &[MemberRecord],
        since: &str,
        priority: i16,
    ) {
        let ids: Vec<String> = members.iter().map(|m| m.member_id.clone()).collect();
        let size = self.config.max_batch_size(resource_type);

        units.extend(chunk_members(&ids, size).into_iter().map(|member_ids| WorkUnit {
            job_id: job.id,
            org_id: job.org_id.clone(),
            resource_type,
            since: since.to_string(),
            member_ids,
            priority,
        }));
    }
}
