//! WorkQueue trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::StoreError;
use crate::reliability::RetryPolicy;

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Leased,
    Completed,
    Dead,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }
}

/// A work unit to be enqueued
#[derive(Debug, Clone)]
pub struct NewUnit {
    pub job_id: Uuid,
    /// Serialized work-unit description
    pub payload: serde_json::Value,
    /// Lower values are leased first
    pub priority: i16,
    pub retry_policy: RetryPolicy,
}

/// A unit currently leased by one worker
#[derive(Debug, Clone)]
pub struct LeasedUnit {
    pub id: Uuid,
    pub job_id: Uuid,
    pub payload: serde_json::Value,
    pub priority: i16,
    /// 1-based attempt number of this lease
    pub attempt: u32,
    pub max_attempts: u32,
    pub lease_expires_at: DateTime<Utc>,
}

impl LeasedUnit {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome of failing a unit
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Unit returns to the queue after `delay`
    WillRetry { next_attempt: u32, delay: Duration },

    /// No attempts remain; the unit is dead
    Exhausted { attempts: u32 },

    /// The caller no longer holds the lease; nothing changed
    LeaseLost,
}

/// A unit whose lease expired without an ack or fail
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedUnit {
    pub id: Uuid,
    pub job_id: Uuid,
    /// True when the expired lease was the last allowed attempt
    pub exhausted: bool,
}

/// Durable queue of serialized work units
///
/// Delivery is at-least-once: a unit is handed to exactly one worker at a
/// time, and is handed out again if that worker fails it or lets the lease
/// expire.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Enqueue a unit, returning its id
    async fn enqueue(&self, unit: NewUnit) -> Result<Uuid, StoreError>;

    /// Lease up to `max_units` visible units for `lease_for`
    ///
    /// Ordered by priority (ascending), then visibility time, then enqueue
    /// order. Increments each unit's attempt counter.
    async fn lease(
        &self,
        worker_id: &str,
        max_units: usize,
        lease_for: Duration,
    ) -> Result<Vec<LeasedUnit>, StoreError>;

    /// Extend a lease still held by `worker_id`
    ///
    /// Returns false if the lease was lost (expired and reclaimed, or acked).
    async fn renew(
        &self,
        unit_id: Uuid,
        worker_id: &str,
        lease_for: Duration,
    ) -> Result<bool, StoreError>;

    /// Acknowledge successful processing of a lease held by `worker_id`
    ///
    /// Returns false, leaving the unit untouched, if the lease was lost.
    async fn ack(&self, unit_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Fail the current attempt, requeueing with backoff while attempts remain
    ///
    /// A caller that no longer holds the lease gets `LeaseLost`.
    async fn fail(
        &self,
        unit_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<FailureOutcome, StoreError>;

    /// Return units with expired leases to the queue
    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedUnit>, StoreError>;

    /// Number of units not yet completed or dead
    async fn depth(&self) -> Result<usize, StoreError>;
}
