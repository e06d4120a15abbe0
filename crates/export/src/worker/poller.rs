//! Unit polling with exponential backoff
//!
//! Leases work with adaptive polling intervals: back off while the queue is
//! empty, snap back to the minimum as soon as work shows up.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::config::duration_millis;
use crate::persistence::StoreError;
use crate::queue::{LeasedUnit, WorkQueue};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when units are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no units found
    pub backoff_multiplier: f64,

    /// Maximum units to lease per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Unit poller with adaptive backoff
pub struct UnitPoller {
    queue: Arc<dyn WorkQueue>,
    worker_id: String,
    lease_duration: Duration,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl UnitPoller {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        worker_id: String,
        lease_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            lease_duration,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Lease up to `max_units` units and update backoff state
    ///
    /// Leases nothing once shutdown has been signaled.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_units: usize) -> Result<Vec<LeasedUnit>, StoreError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_units.min(self.config.batch_size);
        let units = self
            .queue
            .lease(&self.worker_id, batch_size, self.lease_duration)
            .await?;

        if units.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "No units found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = units.len(), "Leased units");
        }

        Ok(units)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns true if shutdown was signaled.
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}
