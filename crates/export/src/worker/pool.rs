//! Worker pool for unit execution
//!
//! Manages concurrent unit execution, lease renewal, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, UnitPoller};
use super::processor::UnitProcessor;
use crate::config::duration_millis;
use crate::model::JobStatus;
use crate::persistence::{JobStore, StoreError};
use crate::queue::{FailureOutcome, LeasedUnit, WorkQueue};

/// Floor for timer-driven loops; `tokio::time::interval` rejects zero
const MIN_LOOP_INTERVAL: Duration = Duration::from_millis(1);

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent unit executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// How long a lease lasts without renewal
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Lease renewal interval for in-flight units
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Expired lease reclamation interval
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 2,
            poller: PollerConfig::default(),
            lease_duration: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(120),
        }
    }
}

impl WorkerPoolConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_ID`: worker identity (default: generated)
    /// - `WORKER_POOL_SIZE`: maximum concurrent units (default: 2)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(id) = std::env::var("WORKER_ID") {
            if !id.trim().is_empty() {
                config.worker_id = id.trim().to_string();
            }
        }
        if let Some(size) = std::env::var("WORKER_POOL_SIZE")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
        {
            config = config.with_max_concurrency(size);
        }
        config
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_LOOP_INTERVAL);
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval.max(MIN_LOOP_INTERVAL);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and leasing units
    Running,
    /// Worker is draining (finishing in-flight units, leasing nothing new)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Move a job whose unit ran out of attempts to Failed
async fn fail_job(jobs: &dyn JobStore, job_id: Uuid) {
    match jobs
        .transition_status(
            job_id,
            &[JobStatus::Pending, JobStatus::InProgress],
            JobStatus::Failed,
        )
        .await
    {
        Ok(true) => warn!(%job_id, "job failed: work unit exhausted its attempts"),
        Ok(false) => debug!(%job_id, "job already terminal"),
        Err(e) => error!(%job_id, "Failed to mark job failed: {}", e),
    }
}

/// Pool of concurrent unit executors
///
/// # Example
///
/// ```ignore
/// use bulk_export::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(queue, jobs, processor, WorkerPoolConfig::from_env());
/// pool.start().await?;
///
/// // ... on SIGTERM
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    jobs: Arc<dyn JobStore>,
    processor: Arc<UnitProcessor>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_units: Arc<Semaphore>,
    in_flight: Arc<DashSet<Uuid>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        jobs: Arc<dyn JobStore>,
        processor: Arc<UnitProcessor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            queue,
            jobs,
            processor,
            active_units: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            in_flight: Arc::new(DashSet::new()),
            poll_handle: Mutex::new(None),
            heartbeat_handle: Mutex::new(None),
            reclaim_handle: Mutex::new(None),
        }
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        self.shutdown_tx.send_replace(false);
        self.start_poll_loop();
        self.start_heartbeat_loop();
        self.start_reclaim_loop();

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops leasing immediately, then waits for in-flight units to finish.
    /// Leases keep being renewed until the drain completes.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Running {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!("Poll loop panicked: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let drained = loop {
            let available = self.active_units.available_permits();
            if available == self.config.max_concurrency {
                debug!("All units completed");
                break true;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_units = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                break false;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        for handle in [
            self.heartbeat_handle.lock().take(),
            self.reclaim_handle.lock().take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }

        *self.status.write() = WorkerPoolStatus::Stopped;

        if !drained {
            return Err(WorkerPoolError::ShutdownTimeout);
        }
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of units currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn start_poll_loop(&self) {
        let queue = Arc::clone(&self.queue);
        let jobs = Arc::clone(&self.jobs);
        let processor = Arc::clone(&self.processor);
        let active_units = Arc::clone(&self.active_units);
        let in_flight = Arc::clone(&self.in_flight);
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut poller = UnitPoller::new(
                Arc::clone(&queue),
                config.worker_id.clone(),
                config.lease_duration,
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_units.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(units) => {
                        for unit in units {
                            // Only this loop acquires permits, so one is free
                            let permit = match Arc::clone(&active_units).acquire_owned().await {
                                Ok(p) => p,
                                Err(_) => break,
                            };

                            in_flight.insert(unit.id);
                            let queue = Arc::clone(&queue);
                            let jobs = Arc::clone(&jobs);
                            let processor = Arc::clone(&processor);
                            let in_flight = Arc::clone(&in_flight);
                            let worker_id = config.worker_id.clone();

                            tokio::spawn(async move {
                                let unit_id = unit.id;
                                execute_unit(&*queue, &*jobs, &processor, &worker_id, unit)
                                    .await;
                                in_flight.remove(&unit_id);
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Renew leases of in-flight units until the pool stops
    fn start_heartbeat_loop(&self) {
        let queue = Arc::clone(&self.queue);
        let in_flight = Arc::clone(&self.in_flight);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval.max(MIN_LOOP_INTERVAL);
        let lease_duration = self.config.lease_duration;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let ids: Vec<Uuid> = in_flight.iter().map(|id| *id).collect();
                for unit_id in ids {
                    match queue.renew(unit_id, &worker_id, lease_duration).await {
                        Ok(true) => {}
                        Ok(false) => warn!(%unit_id, "Lease lost, unit may be redelivered"),
                        Err(e) => error!(%unit_id, "Lease renewal failed: {}", e),
                    }
                }
            }
        });

        *self.heartbeat_handle.lock() = Some(handle);
    }

    /// Return expired leases to the queue
    fn start_reclaim_loop(&self) {
        let queue = Arc::clone(&self.queue);
        let jobs = Arc::clone(&self.jobs);
        let interval = self.config.reclaim_interval.max(MIN_LOOP_INTERVAL);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.reclaim_expired().await {
                            Ok(reclaimed) => {
                                if !reclaimed.is_empty() {
                                    info!(count = reclaimed.len(), "Reclaimed expired leases");
                                }
                                for unit in reclaimed.iter().filter(|u| u.exhausted) {
                                    fail_job(&*jobs, unit.job_id).await;
                                }
                            }
                            Err(e) => {
                                error!("Lease reclamation failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        });

        *self.reclaim_handle.lock() = Some(handle);
    }
}

/// Process one unit and report the result to the queue
async fn execute_unit(
    queue: &dyn WorkQueue,
    jobs: &dyn JobStore,
    processor: &UnitProcessor,
    worker_id: &str,
    unit: LeasedUnit,
) {
    let unit_id = unit.id;
    let job_id = unit.job_id;

    match processor.process(&unit).await {
        Ok(_) => match queue.ack(unit_id, worker_id).await {
            Ok(true) => {}
            Ok(false) => warn!(%unit_id, "Ack ignored, lease was lost"),
            Err(e) => error!(%unit_id, "Failed to ack unit: {}", e),
        },
        Err(err) => {
            warn!(%unit_id, %job_id, attempt = unit.attempt, "Work unit failed: {}", err);
            match queue.fail(unit_id, worker_id, &err.to_string()).await {
                Ok(FailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                }) => {
                    debug!(%unit_id, next_attempt, delay_ms = delay.as_millis() as u64, "unit will retry");
                }
                Ok(FailureOutcome::Exhausted { .. }) => fail_job(jobs, job_id).await,
                Ok(FailureOutcome::LeaseLost) => {
                    warn!(%unit_id, "Failure ignored, lease was lost")
                }
                Err(e) => error!(%unit_id, "Failed to fail unit: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.max_concurrency, 2);
        assert!(config.heartbeat_interval < config.lease_duration);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::default()
            .with_worker_id("export-worker-1")
            .with_max_concurrency(0)
            .with_lease_duration(Duration::from_secs(30))
            .with_heartbeat_interval(Duration::from_secs(10));

        assert_eq!(config.worker_id, "export-worker-1");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = WorkerPoolConfig::default()
            .with_heartbeat_interval(Duration::ZERO)
            .with_reclaim_interval(Duration::ZERO);

        assert_eq!(config.heartbeat_interval, MIN_LOOP_INTERVAL);
        assert_eq!(config.reclaim_interval, MIN_LOOP_INTERVAL);
    }

    #[test]
    fn test_config_serialization() {
        let config = WorkerPoolConfig::default().with_shutdown_timeout(Duration::from_secs(5));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["shutdown_timeout"], 5000);
    }
}
