//! Job completion tracking
//!
//! Completion is count-based: a job is done once it holds as many distinct
//! completion markers as it has work units, in whatever order they arrived.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::model::{ExportJob, JobStatus};
use crate::persistence::{JobStore, StoreError};

/// Aggregates completion markers into job status
pub struct CompletionTracker {
    jobs: Arc<dyn JobStore>,
}

impl CompletionTracker {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Whether `job` is complete, moving it to Completed when its markers
    /// have caught up
    ///
    /// A job already marked Completed is complete without a recount. Safe to
    /// call repeatedly and concurrently; the only write is an idempotent
    /// compare-and-set.
    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    pub async fn check_completed_and_cleanup(&self, job: &ExportJob) -> Result<bool, StoreError> {
        match job.status {
            JobStatus::Completed => return Ok(true),
            JobStatus::Failed | JobStatus::Archived => return Ok(false),
            JobStatus::Pending | JobStatus::InProgress => {}
        }

        // Never scheduled
        if job.job_count == 0 {
            return Ok(false);
        }

        let markers = self.jobs.count_markers(job.id).await?;
        if markers < job.job_count {
            debug!(markers, job_count = job.job_count, "job not yet complete");
            return Ok(false);
        }

        let moved = self
            .jobs
            .transition_status(
                job.id,
                &[JobStatus::Pending, JobStatus::InProgress],
                JobStatus::Completed,
            )
            .await?;
        if moved {
            info!(markers, job_count = job.job_count, "job completed");
            return Ok(true);
        }

        // Lost the race; report what the winner left behind
        let current = self.jobs.get_job(job.id).await?;
        Ok(current.status == JobStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CompletionMarker, InMemoryJobStore};
    use uuid::Uuid;

    async fn scheduled_job(store: &InMemoryJobStore, count: u32) -> ExportJob {
        let job = ExportJob::new("A9994", "/api/v1/Patient/$export");
        store.create_job(&job).await.unwrap();
        store.set_job_count(job.id, count).await.unwrap();
        store.get_job(job.id).await.unwrap()
    }

    async fn add_markers(store: &InMemoryJobStore, job: &ExportJob, n: usize) {
        for _ in 0..n {
            store
                .record_marker(CompletionMarker::new(
                    job.id,
                    Uuid::now_v7(),
                    "A9994-Patient.ndjson",
                ))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_completes_once_markers_reach_job_count() {
        let store = Arc::new(InMemoryJobStore::new());
        let tracker = CompletionTracker::new(store.clone());
        let job = scheduled_job(&store, 10).await;

        add_markers(&store, &job, 5).await;
        assert!(!tracker.check_completed_and_cleanup(&job).await.unwrap());
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Pending);

        add_markers(&store, &job, 5).await;
        assert!(tracker.check_completed_and_cleanup(&job).await.unwrap());
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_external_completion_is_authoritative() {
        let store = Arc::new(InMemoryJobStore::new());
        let tracker = CompletionTracker::new(store.clone());
        let mut job = scheduled_job(&store, 10).await;
        job.status = JobStatus::Completed;

        assert!(tracker.check_completed_and_cleanup(&job).await.unwrap());
        assert_eq!(store.count_markers(job.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeated_checks_are_idempotent() {
        let store = Arc::new(InMemoryJobStore::new());
        let tracker = CompletionTracker::new(store.clone());
        let job = scheduled_job(&store, 4).await;
        add_markers(&store, &job, 3).await;

        let first = tracker.check_completed_and_cleanup(&job).await.unwrap();
        let second = tracker.check_completed_and_cleanup(&job).await.unwrap();
        assert_eq!(first, second);
        assert!(!first);

        add_markers(&store, &job, 1).await;
        assert!(tracker.check_completed_and_cleanup(&job).await.unwrap());
        // Stale snapshot of the job, status already flipped by the first call
        assert!(tracker.check_completed_and_cleanup(&job).await.unwrap());
    }

    #[tokio::test]
    async fn test_unscheduled_and_failed_jobs_are_not_complete() {
        let store = Arc::new(InMemoryJobStore::new());
        let tracker = CompletionTracker::new(store.clone());

        let unscheduled = ExportJob::new("A9994", "/api/v1/Patient/$export");
        store.create_job(&unscheduled).await.unwrap();
        assert!(!tracker.check_completed_and_cleanup(&unscheduled).await.unwrap());

        let mut failed = scheduled_job(&store, 1).await;
        add_markers(&store, &failed, 1).await;
        store.force_status(failed.id, JobStatus::Failed);
        failed.status = JobStatus::Failed;
        assert!(!tracker.check_completed_and_cleanup(&failed).await.unwrap());
        assert_eq!(store.get_job(failed.id).await.unwrap().status, JobStatus::Failed);
    }
}
