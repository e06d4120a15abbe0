//! Inbound entry points used by the API layer
//!
//! [`ExportService`] is constructed once per process with its collaborators
//! and passed to request handlers by reference.

use std::sync::Arc;

use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::model::{is_supported_org, ExportJob, JobStatus, JobStatusReport, ResourceType, Since};
use crate::persistence::{JobStore, StoreError};
use crate::population::PopulationRepository;
use crate::queue::{NewUnit, WorkQueue};
use crate::reliability::RetryPolicy;
use crate::resolver::BeneficiaryResolver;
use crate::splitter::JobSplitter;
use crate::tracker::CompletionTracker;

/// Creates, schedules, and reports on export jobs
pub struct ExportService {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    splitter: JobSplitter,
    tracker: CompletionTracker,
    retry_policy: RetryPolicy,
}

impl ExportService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        population: Arc<dyn PopulationRepository>,
        config: ExportConfig,
    ) -> Self {
        let resolver = Arc::new(BeneficiaryResolver::new(population, &config));
        let retry_policy = config.retry_policy.clone();

        Self {
            tracker: CompletionTracker::new(Arc::clone(&jobs)),
            splitter: JobSplitter::new(resolver, config),
            jobs,
            queue,
            retry_policy,
        }
    }

    /// Accept an export request, returning the new job's id
    #[instrument(skip(self))]
    pub async fn create_job(&self, org_id: &str, request_url: &str) -> Result<Uuid, ExportError> {
        if !is_supported_org(org_id) {
            return Err(ExportError::InvalidOrganization(org_id.to_string()));
        }

        let job = ExportJob::new(org_id, request_url);
        self.jobs.create_job(&job).await?;
        info!(job_id = %job.id, "export job created");
        Ok(job.id)
    }

    /// Split a pending job into work units and enqueue them all
    ///
    /// Resolution and splitting errors return before anything is enqueued.
    /// An empty `resource_types` means every type. Returns the number of
    /// units enqueued, which becomes the job's immutable unit count.
    #[instrument(skip(self, resource_types, since), fields(since = since.map(Since::as_str)))]
    pub async fn schedule(
        &self,
        job_id: Uuid,
        resource_types: &[ResourceType],
        since: Option<&Since>,
        diff: bool,
    ) -> Result<usize, ExportError> {
        let job = self.jobs.get_job(job_id).await?;
        if job.status != JobStatus::Pending || job.job_count != 0 {
            return Err(ExportError::JobNotSchedulable {
                job_id,
                status: job.status,
                job_count: job.job_count,
            });
        }

        let resource_types = if resource_types.is_empty() {
            &ResourceType::ALL[..]
        } else {
            resource_types
        };

        let units = self.splitter.split(&job, resource_types, since, diff).await?;
        self.jobs.set_job_count(job_id, units.len() as u32).await?;

        for (i, unit) in units.iter().enumerate() {
            let enqueued = match serde_json::to_value(unit) {
                Ok(payload) => {
                    self.queue
                        .enqueue(NewUnit {
                            job_id,
                            payload,
                            priority: unit.priority,
                            retry_policy: self.retry_policy.clone(),
                        })
                        .await
                }
                Err(e) => Err(StoreError::Serialization(e.to_string())),
            };

            if let Err(e) = enqueued {
                error!(%job_id, enqueued = i, total = units.len(), "Enqueue failed: {}", e);
                self.jobs
                    .transition_status(job_id, &[JobStatus::Pending], JobStatus::Failed)
                    .await?;
                return Err(e.into());
            }
        }

        info!(%job_id, units = units.len(), "export job scheduled");
        Ok(units.len())
    }

    /// Current status of a job, completing it first if its markers are in
    #[instrument(skip(self))]
    pub async fn poll_status(&self, job_id: Uuid) -> Result<JobStatusReport, ExportError> {
        let mut job = self.jobs.get_job(job_id).await?;

        if self.tracker.check_completed_and_cleanup(&job).await? && job.status != JobStatus::Completed
        {
            job = self.jobs.get_job(job_id).await?;
        }

        Ok(JobStatusReport::from(&job))
    }
}
