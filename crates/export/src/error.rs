//! Errors surfaced synchronously to callers of the scheduling path

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::JobStatus;
use crate::persistence::StoreError;

/// Error type for resolution, splitting, and scheduling
///
/// Worker-side failures never surface here; they are observable only through
/// job status and the error artifact.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// No complete population snapshot is eligible for the organization
    #[error("no complete population snapshot for {org_id} (cutoff {cutoff:?})")]
    NoSnapshot {
        org_id: String,
        cutoff: Option<DateTime<Utc>>,
    },

    /// Resolution produced zero members after suppression filtering
    #[error("found 0 beneficiaries for {org_id} in snapshot {snapshot_id}")]
    EmptyResult { org_id: String, snapshot_id: i64 },

    #[error("invalid request type: {0}")]
    InvalidResourceType(String),

    #[error("unsupported organization identifier: {0}")]
    InvalidOrganization(String),

    #[error("invalid since parameter: {0}")]
    InvalidSince(String),

    /// Diff mode was requested without a `since` instant
    #[error("diff mode requires a since parameter")]
    MissingSince,

    /// The job has already been scheduled or has left the Pending state
    #[error("job {job_id} cannot be scheduled in status {status} with {job_count} units")]
    JobNotSchedulable {
        job_id: Uuid,
        status: JobStatus,
        job_count: u32,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
