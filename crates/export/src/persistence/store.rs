//! JobStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ExportJob, JobStatus};

/// Error type for store operations
///
/// Shared by every persistence seam: the job store, the work queue, and the
/// population repository.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Queued unit not found
    #[error("work unit not found: {0}")]
    UnitNotFound(Uuid),

    /// Compare-and-set precondition did not hold
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable evidence that one work unit of a job finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub job_id: Uuid,
    /// Queue item that produced the marker; markers are distinct per unit
    pub unit_id: Uuid,
    /// Artifact the unit appended to
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

impl CompletionMarker {
    pub fn new(job_id: Uuid, unit_id: Uuid, file_name: impl Into<String>) -> Self {
        Self {
            job_id,
            unit_id,
            file_name: file_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Store for export jobs and their completion markers
///
/// Implementations must be thread-safe. Status changes go through
/// [`JobStore::transition_status`], which is an atomic compare-and-set so that
/// concurrent workers racing on `Pending -> In Progress` never lose updates.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a newly accepted job
    async fn create_job(&self, job: &ExportJob) -> Result<(), StoreError>;

    /// Load a job by id
    async fn get_job(&self, job_id: Uuid) -> Result<ExportJob, StoreError>;

    /// Record the total number of work units
    ///
    /// Only allowed while the job is Pending and unscheduled; the count is
    /// immutable afterwards.
    async fn set_job_count(&self, job_id: Uuid, count: u32) -> Result<(), StoreError>;

    /// Move the job to `to` if its current status is one of `from`
    ///
    /// Returns whether the transition happened. `from` entries that cannot
    /// legally reach `to` are ignored.
    async fn transition_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, StoreError>;

    /// Record a completion marker
    ///
    /// Idempotent per `unit_id`: a redelivered unit does not count twice.
    /// Returns whether the marker was newly inserted.
    async fn record_marker(&self, marker: CompletionMarker) -> Result<bool, StoreError>;

    /// Count distinct completion markers for a job
    async fn count_markers(&self, job_id: Uuid) -> Result<u32, StoreError>;

    /// List completion markers for a job, oldest first
    async fn list_markers(&self, job_id: Uuid) -> Result<Vec<CompletionMarker>, StoreError>;
}

/// The subset of `from` that may legally move to `to`
pub(crate) fn legal_sources(from: &[JobStatus], to: JobStatus) -> Vec<JobStatus> {
    from.iter()
        .copied()
        .filter(|s| s.can_transition_to(to))
        .collect()
}
