//! PostgreSQL implementation of WorkQueue
//!
//! Leasing uses `SELECT ... FOR UPDATE SKIP LOCKED` inside a single
//! `UPDATE ... RETURNING`, so many workers can poll the same table without
//! ever holding the same unit.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::persistence::StoreError;
use crate::reliability::RetryPolicy;

/// PostgreSQL implementation of WorkQueue
#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_exists(&self, unit_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("SELECT 1 FROM export_work_queue WHERE id = $1")
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|_| ())
            .ok_or(StoreError::UnitNotFound(unit_id))
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    #[instrument(skip(self, unit), fields(job_id = %unit.job_id, priority = unit.priority))]
    async fn enqueue(&self, unit: NewUnit) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let policy_json = serde_json::to_value(&unit.retry_policy)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO export_work_queue
                (id, job_id, payload, priority, retry_policy, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(unit.job_id)
        .bind(&unit.payload)
        .bind(unit.priority)
        .bind(&policy_json)
        .bind(unit.retry_policy.max_attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue work unit: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(unit_id = %id, "enqueued work unit");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn lease(
        &self,
        worker_id: &str,
        max_units: usize,
        lease_for: Duration,
    ) -> Result<Vec<LeasedUnit>, StoreError> {
        if max_units == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM export_work_queue
                WHERE status = 'pending'
                  AND visible_at <= NOW()
                ORDER BY priority ASC, visible_at, enqueued_seq
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE export_work_queue q
            SET status = 'leased',
                leased_by = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                attempt = q.attempt + 1
            FROM claimable c
            WHERE q.id = c.id
            RETURNING q.id, q.job_id, q.payload, q.priority, q.attempt, q.max_attempts,
                      q.lease_expires_at, q.visible_at, q.enqueued_seq
            "#,
        )
        .bind(max_units as i64)
        .bind(worker_id)
        .bind(lease_for.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lease work units: {}", e);
            StoreError::Database(e.to_string())
        })?;

        // RETURNING does not preserve the CTE ordering
        let mut keyed: Vec<_> = rows
            .iter()
            .map(|row| {
                let key = (
                    row.get::<i16, _>("priority"),
                    row.get::<chrono::DateTime<Utc>, _>("visible_at"),
                    row.get::<i64, _>("enqueued_seq"),
                );
                let unit = LeasedUnit {
                    id: row.get("id"),
                    job_id: row.get("job_id"),
                    payload: row.get("payload"),
                    priority: row.get("priority"),
                    attempt: row.get::<i32, _>("attempt") as u32,
                    max_attempts: row.get::<i32, _>("max_attempts") as u32,
                    lease_expires_at: row.get("lease_expires_at"),
                };
                (key, unit)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let leased: Vec<LeasedUnit> = keyed.into_iter().map(|(_, unit)| unit).collect();
        if !leased.is_empty() {
            debug!(worker_id, count = leased.len(), "leased work units");
        }
        Ok(leased)
    }

    #[instrument(skip(self))]
    async fn renew(
        &self,
        unit_id: Uuid,
        worker_id: &str,
        lease_for: Duration,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE export_work_queue
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND leased_by = $2 AND status = 'leased'
            "#,
        )
        .bind(unit_id)
        .bind(worker_id)
        .bind(lease_for.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    #[instrument(skip(self))]
    async fn ack(&self, unit_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE export_work_queue
            SET status = 'completed', leased_by = NULL, lease_expires_at = NULL
            WHERE id = $1 AND leased_by = $2 AND status = 'leased'
            "#,
        )
        .bind(unit_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            self.ensure_exists(unit_id).await?;
            debug!(%unit_id, worker_id, "ack ignored, lease no longer held");
            return Ok(false);
        }
        debug!(%unit_id, "acked work unit");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn fail(
        &self,
        unit_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT attempt, retry_policy, status, leased_by
            FROM export_work_queue
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::UnitNotFound(unit_id))?;

        let held = row.get::<String, _>("status") == UnitStatus::Leased.as_str()
            && row.get::<Option<String>, _>("leased_by").as_deref() == Some(worker_id);
        if !held {
            tx.rollback().await?;
            debug!(%unit_id, worker_id, "fail ignored, lease no longer held");
            return Ok(FailureOutcome::LeaseLost);
        }

        let attempt = row.get::<i32, _>("attempt") as u32;
        let policy: RetryPolicy = serde_json::from_value(row.get("retry_policy"))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome = if policy.has_attempts_remaining(attempt) {
            let next_attempt = attempt + 1;
            let delay = policy.delay_before_attempt(next_attempt);
            let visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE export_work_queue
                SET status = 'pending',
                    leased_by = NULL,
                    lease_expires_at = NULL,
                    last_error = $2,
                    visible_at = $3
                WHERE id = $1
                "#,
            )
            .bind(unit_id)
            .bind(error)
            .bind(visible_at)
            .execute(&mut *tx)
            .await?;

            FailureOutcome::WillRetry {
                next_attempt,
                delay,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE export_work_queue
                SET status = 'dead', leased_by = NULL, lease_expires_at = NULL, last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(unit_id)
            .bind(error)
            .execute(&mut *tx)
            .await?;

            FailureOutcome::Exhausted { attempts: attempt }
        };

        tx.commit().await?;
        debug!(%unit_id, ?outcome, "failed work unit");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedUnit>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE export_work_queue
            SET status = CASE WHEN attempt >= max_attempts THEN 'dead' ELSE 'pending' END,
                leased_by = NULL,
                lease_expires_at = NULL,
                last_error = 'lease expired',
                visible_at = NOW()
            WHERE status = 'leased' AND lease_expires_at <= NOW()
            RETURNING id, job_id, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ReclaimedUnit {
                id: row.get("id"),
                job_id: row.get("job_id"),
                exhausted: row.get::<String, _>("status") == UnitStatus::Dead.as_str(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn depth(&self) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM export_work_queue WHERE status IN ('pending', 'leased')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("depth") as usize)
    }
}
