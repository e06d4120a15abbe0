//! In-memory implementation of WorkQueue for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::*;
use crate::persistence::StoreError;

struct QueuedUnit {
    unit: NewUnit,
    seq: u64,
    status: UnitStatus,
    attempt: u32,
    leased_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    visible_at: DateTime<Utc>,
    error_history: Vec<String>,
}

impl QueuedUnit {
    fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == UnitStatus::Leased && self.leased_by.as_deref() == Some(worker_id)
    }
}

#[derive(Default)]
struct QueueState {
    units: HashMap<Uuid, QueuedUnit>,
    next_seq: u64,
}

/// In-memory implementation of WorkQueue
///
/// A single mutex guards leasing, which gives the same single-owner
/// guarantee as `SKIP LOCKED` in the PostgreSQL implementation.
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Get the number of units in the given status
    pub fn count_with_status(&self, status: UnitStatus) -> usize {
        self.state
            .lock()
            .units
            .values()
            .filter(|u| u.status == status)
            .count()
    }

    /// Get a unit's status
    pub fn status_of(&self, unit_id: Uuid) -> Option<UnitStatus> {
        self.state.lock().units.get(&unit_id).map(|u| u.status)
    }

    /// Get the failure messages recorded for a unit
    pub fn errors_of(&self, unit_id: Uuid) -> Vec<String> {
        self.state
            .lock()
            .units
            .get(&unit_id)
            .map(|u| u.error_history.clone())
            .unwrap_or_default()
    }

    /// Payloads of every enqueued unit in enqueue order
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        let state = self.state.lock();
        let mut units: Vec<_> = state.units.values().collect();
        units.sort_by_key(|u| u.seq);
        units.iter().map(|u| u.unit.payload.clone()).collect()
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_deadline(lease_for: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease_for).unwrap_or_default()
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, unit: NewUnit) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.units.insert(
            id,
            QueuedUnit {
                unit,
                seq,
                status: UnitStatus::Pending,
                attempt: 0,
                leased_by: None,
                lease_expires_at: None,
                visible_at: Utc::now(),
                error_history: vec![],
            },
        );
        Ok(id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_units: usize,
        lease_for: Duration,
    ) -> Result<Vec<LeasedUnit>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let mut candidates: Vec<(i16, DateTime<Utc>, u64, Uuid)> = state
            .units
            .iter()
            .filter(|(_, u)| u.status == UnitStatus::Pending && u.visible_at <= now)
            .map(|(id, u)| (u.unit.priority, u.visible_at, u.seq, *id))
            .collect();
        candidates.sort();

        let mut leased = Vec::with_capacity(max_units.min(candidates.len()));
        for (_, _, _, id) in candidates.into_iter().take(max_units) {
            let Some(queued) = state.units.get_mut(&id) else {
                continue;
            };
            let expires = lease_deadline(lease_for);
            queued.status = UnitStatus::Leased;
            queued.leased_by = Some(worker_id.to_string());
            queued.lease_expires_at = Some(expires);
            queued.attempt += 1;

            leased.push(LeasedUnit {
                id,
                job_id: queued.unit.job_id,
                payload: queued.unit.payload.clone(),
                priority: queued.unit.priority,
                attempt: queued.attempt,
                max_attempts: queued.unit.retry_policy.max_attempts,
                lease_expires_at: expires,
            });
        }

        Ok(leased)
    }

    async fn renew(
        &self,
        unit_id: Uuid,
        worker_id: &str,
        lease_for: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let queued = state
            .units
            .get_mut(&unit_id)
            .ok_or(StoreError::UnitNotFound(unit_id))?;

        if !queued.is_held_by(worker_id) {
            return Ok(false);
        }

        queued.lease_expires_at = Some(lease_deadline(lease_for));
        Ok(true)
    }

    async fn ack(&self, unit_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let queued = state
            .units
            .get_mut(&unit_id)
            .ok_or(StoreError::UnitNotFound(unit_id))?;

        if !queued.is_held_by(worker_id) {
            return Ok(false);
        }

        queued.status = UnitStatus::Completed;
        queued.leased_by = None;
        queued.lease_expires_at = None;
        Ok(true)
    }

    async fn fail(
        &self,
        unit_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let mut state = self.state.lock();
        let queued = state
            .units
            .get_mut(&unit_id)
            .ok_or(StoreError::UnitNotFound(unit_id))?;

        if !queued.is_held_by(worker_id) {
            return Ok(FailureOutcome::LeaseLost);
        }

        queued.error_history.push(error.to_string());
        queued.leased_by = None;
        queued.lease_expires_at = None;

        let policy = &queued.unit.retry_policy;
        if policy.has_attempts_remaining(queued.attempt) {
            let next_attempt = queued.attempt + 1;
            let delay = policy.delay_before_attempt(next_attempt);
            queued.status = UnitStatus::Pending;
            queued.visible_at = lease_deadline(delay);
            Ok(FailureOutcome::WillRetry {
                next_attempt,
                delay,
            })
        } else {
            queued.status = UnitStatus::Dead;
            Ok(FailureOutcome::Exhausted {
                attempts: queued.attempt,
            })
        }
    }

    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedUnit>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut reclaimed = vec![];

        for (id, queued) in state.units.iter_mut() {
            let expired = queued.status == UnitStatus::Leased
                && queued.lease_expires_at.map(|t| t <= now).unwrap_or(true);
            if !expired {
                continue;
            }

            queued.leased_by = None;
            queued.lease_expires_at = None;
            queued.error_history.push("lease expired".to_string());

            let exhausted = !queued.unit.retry_policy.has_attempts_remaining(queued.attempt);
            queued.status = if exhausted {
                UnitStatus::Dead
            } else {
                UnitStatus::Pending
            };

            reclaimed.push(ReclaimedUnit {
                id: *id,
                job_id: queued.unit.job_id,
                exhausted,
            });
        }

        Ok(reclaimed)
    }

    async fn depth(&self) -> Result<usize, StoreError> {
        Ok(self
            .state
            .lock()
            .units
            .values()
            .filter(|u| matches!(u.status, UnitStatus::Pending | UnitStatus::Leased))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use serde_json::json;

    fn unit(priority: i16, tag: &str, policy: RetryPolicy) -> NewUnit {
        NewUnit {
            job_id: Uuid::now_v7(),
            payload: json!({ "tag": tag }),
            priority,
            retry_policy: policy,
        }
    }

    #[tokio::test]
    async fn test_lease_orders_by_priority_then_enqueue_order() {
        let queue = InMemoryWorkQueue::new();
        let policy = RetryPolicy::immediate(3);
        queue.enqueue(unit(100, "eob", policy.clone())).await.unwrap();
        queue.enqueue(unit(20, "patient-1", policy.clone())).await.unwrap();
        queue.enqueue(unit(20, "patient-2", policy.clone())).await.unwrap();
        queue.enqueue(unit(10, "expedited", policy)).await.unwrap();

        let leased = queue
            .lease("worker-1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        let tags: Vec<_> = leased.iter().map(|u| u.payload["tag"].clone()).collect();
        assert_eq!(
            tags,
            vec![
                json!("expedited"),
                json!("patient-1"),
                json!("patient-2"),
                json!("eob")
            ]
        );
        assert!(leased.iter().all(|u| u.attempt == 1));
    }

    #[tokio::test]
    async fn test_leased_unit_is_invisible_to_other_workers() {
        let queue = InMemoryWorkQueue::new();
        queue
            .enqueue(unit(20, "only", RetryPolicy::immediate(3)))
            .await
            .unwrap();

        let first = queue.lease("worker-1", 1, Duration::from_secs(60)).await.unwrap();
        let second = queue.lease("worker-2", 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());

        assert!(queue.renew(first[0].id, "worker-1", Duration::from_secs(60)).await.unwrap());
        assert!(!queue.renew(first[0].id, "worker-2", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_retries_then_exhausts() {
        let queue = InMemoryWorkQueue::new();
        let id = queue
            .enqueue(unit(20, "flaky", RetryPolicy::immediate(2)))
            .await
            .unwrap();

        queue.lease("w", 1, Duration::from_secs(60)).await.unwrap();
        let outcome = queue.fail(id, "w", "boom 1").await.unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::WillRetry {
                next_attempt: 2,
                delay: Duration::ZERO
            }
        );

        let again = queue.lease("w", 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(again[0].attempt, 2);
        assert!(again[0].is_final_attempt());

        let outcome = queue.fail(id, "w", "boom 2").await.unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted { attempts: 2 });
        assert_eq!(queue.status_of(id), Some(UnitStatus::Dead));
        assert_eq!(queue.errors_of(id), vec!["boom 1", "boom 2"]);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ack_completes_unit() {
        let queue = InMemoryWorkQueue::new();
        let id = queue
            .enqueue(unit(20, "ok", RetryPolicy::immediate(3)))
            .await
            .unwrap();
        queue.lease("w", 1, Duration::from_secs(60)).await.unwrap();
        assert!(queue.ack(id, "w").await.unwrap());

        assert_eq!(queue.status_of(id), Some(UnitStatus::Completed));
        assert!(queue.lease("w", 1, Duration::from_secs(60)).await.unwrap().is_empty());
        assert!(!queue.ack(id, "w").await.unwrap());
        assert!(matches!(
            queue.ack(Uuid::now_v7(), "w").await,
            Err(StoreError::UnitNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reclaim_expired_leases() {
        let queue = InMemoryWorkQueue::new();
        let retry = queue
            .enqueue(unit(20, "retry", RetryPolicy::immediate(2)))
            .await
            .unwrap();
        let last = queue
            .enqueue(unit(30, "last", RetryPolicy::no_retry()))
            .await
            .unwrap();

        queue.lease("dead-worker", 2, Duration::ZERO).await.unwrap();
        let mut reclaimed = queue.reclaim_expired().await.unwrap();
        reclaimed.sort_by_key(|r| r.exhausted);

        assert_eq!(reclaimed.len(), 2);
        assert_eq!(reclaimed[0].id, retry);
        assert!(!reclaimed[0].exhausted);
        assert_eq!(reclaimed[1].id, last);
        assert!(reclaimed[1].exhausted);
        assert_eq!(queue.status_of(retry), Some(UnitStatus::Pending));
        assert_eq!(queue.status_of(last), Some(UnitStatus::Dead));
    }

    #[tokio::test]
    async fn test_stale_fail_leaves_new_lease_alone() {
        let queue = InMemoryWorkQueue::new();
        let id = queue
            .enqueue(unit(20, "slow", RetryPolicy::immediate(3)))
            .await
            .unwrap();

        queue.lease("worker-1", 1, Duration::ZERO).await.unwrap();
        queue.reclaim_expired().await.unwrap();
        let taken = queue.lease("worker-2", 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(taken.len(), 1);

        let outcome = queue.fail(id, "worker-1", "late failure").await.unwrap();
        assert_eq!(outcome, FailureOutcome::LeaseLost);
        assert_eq!(queue.status_of(id), Some(UnitStatus::Leased));
        assert!(queue.lease("worker-3", 1, Duration::from_secs(60)).await.unwrap().is_empty());
        assert!(queue.renew(id, "worker-2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(queue.errors_of(id), vec!["lease expired"]);
    }

    #[tokio::test]
    async fn test_stale_ack_leaves_new_lease_alone() {
        let queue = InMemoryWorkQueue::new();
        let id = queue
            .enqueue(unit(20, "slow", RetryPolicy::immediate(3)))
            .await
            .unwrap();

        queue.lease("worker-1", 1, Duration::ZERO).await.unwrap();
        queue.reclaim_expired().await.unwrap();
        queue.lease("worker-2", 1, Duration::from_secs(60)).await.unwrap();

        assert!(!queue.ack(id, "worker-1").await.unwrap());
        assert_eq!(queue.status_of(id), Some(UnitStatus::Leased));
        assert!(queue.renew(id, "worker-2", Duration::from_secs(60)).await.unwrap());

        assert!(queue.ack(id, "worker-2").await.unwrap());
        assert_eq!(queue.status_of(id), Some(UnitStatus::Completed));
    }
}
