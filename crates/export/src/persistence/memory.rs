//! In-memory implementation of JobStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::model::{ExportJob, JobStatus};

/// In-memory implementation of JobStore
///
/// Provides the same compare-and-set semantics as the PostgreSQL
/// implementation.
///
/// # Example
///
/// ```
/// use bulk_export::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ExportJob>>,
    markers: RwLock<HashMap<Uuid, Vec<CompletionMarker>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            markers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of jobs
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Overwrite a job's status without transition checks (for tests that
    /// model external actors)
    pub fn force_status(&self, job_id: Uuid, status: JobStatus) {
        if let Some(job) = self.jobs.write().get_mut(&job_id) {
            job.status = status;
            job.updated_at = Utc::now();
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &ExportJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::ConcurrencyConflict(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<ExportJob, StoreError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn set_job_count(&self, job_id: Uuid, count: u32) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        if job.status != JobStatus::Pending || job.job_count != 0 {
            return Err(StoreError::ConcurrencyConflict(format!(
                "job {job_id} already scheduled ({}, {} units)",
                job.status, job.job_count
            )));
        }

        job.job_count = count;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let sources = legal_sources(from, to);
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        if !sources.contains(&job.status) {
            return Ok(false);
        }

        job.status = to;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_marker(&self, marker: CompletionMarker) -> Result<bool, StoreError> {
        let mut markers = self.markers.write();
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&marker.job_id)
            .ok_or(StoreError::JobNotFound(marker.job_id))?;

        let entries = markers.entry(marker.job_id).or_default();
        if entries.iter().any(|m| m.unit_id == marker.unit_id) {
            return Ok(false);
        }

        entries.push(marker);
        job.completed_job_count += 1;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn count_markers(&self, job_id: Uuid) -> Result<u32, StoreError> {
        Ok(self
            .markers
            .read()
            .get(&job_id)
            .map(|m| m.len() as u32)
            .unwrap_or(0))
    }

    async fn list_markers(&self, job_id: Uuid) -> Result<Vec<CompletionMarker>, StoreError> {
        Ok(self.markers.read().get(&job_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pending_job(store: &InMemoryJobStore) -> ExportJob {
        let job = ExportJob::new("A9994", "/api/v1/Patient/$export");
        store.create_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_create_and_get_job() {
        let store = InMemoryJobStore::new();
        let job = pending_job(&store).await;

        let loaded = store.get_job(job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.org_id, "A9994");
        assert!(matches!(
            store.get_job(Uuid::now_v7()).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_job_count_is_immutable_once_set() {
        let store = InMemoryJobStore::new();
        let job = pending_job(&store).await;

        store.set_job_count(job.id, 4).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().job_count, 4);

        let result = store.set_job_count(job.id, 7).await;
        assert!(matches!(result, Err(StoreError::ConcurrencyConflict(_))));
        assert_eq!(store.get_job(job.id).await.unwrap().job_count, 4);
    }

    #[tokio::test]
    async fn test_transition_compare_and_set() {
        let store = InMemoryJobStore::new();
        let job = pending_job(&store).await;

        let moved = store
            .transition_status(job.id, &[JobStatus::Pending], JobStatus::InProgress)
            .await
            .unwrap();
        assert!(moved);

        // Second racer loses, status is unchanged
        let moved = store
            .transition_status(job.id, &[JobStatus::Pending], JobStatus::InProgress)
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_backward_transition_is_ignored() {
        let store = InMemoryJobStore::new();
        let job = pending_job(&store).await;
        store.force_status(job.id, JobStatus::Completed);

        let moved = store
            .transition_status(job.id, &[JobStatus::Completed], JobStatus::InProgress)
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_markers_are_distinct_per_unit() {
        let store = InMemoryJobStore::new();
        let job = pending_job(&store).await;
        let unit = Uuid::now_v7();

        assert!(store
            .record_marker(CompletionMarker::new(job.id, unit, "A9994-Patient.ndjson"))
            .await
            .unwrap());
        assert!(!store
            .record_marker(CompletionMarker::new(job.id, unit, "A9994-Patient.ndjson"))
            .await
            .unwrap());
        store
            .record_marker(CompletionMarker::new(
                job.id,
                Uuid::now_v7(),
                "A9994-Patient.ndjson",
            ))
            .await
            .unwrap();

        assert_eq!(store.count_markers(job.id).await.unwrap(), 2);
        assert_eq!(store.get_job(job.id).await.unwrap().completed_job_count, 2);
        assert_eq!(store.list_markers(job.id).await.unwrap().len(), 2);
    }
}
