//! PostgreSQL implementation of JobStore
//!
//! Status changes are single `UPDATE ... WHERE status = ANY(...)` statements,
//! so concurrent workers racing on the same job resolve at the row lock.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::model::{ExportJob, JobStatus};

/// PostgreSQL implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use bulk_export::PostgresJobStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/export").await?;
/// let store = PostgresJobStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn job_exists(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM export_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn job_from_row(row: &PgRow) -> Result<ExportJob, StoreError> {
    let status: String = row.get("status");
    Ok(ExportJob {
        id: row.get("id"),
        org_id: row.get("org_id"),
        request_url: row.get("request_url"),
        status: status.parse().map_err(StoreError::Serialization)?,
        job_count: row.get::<i32, _>("job_count") as u32,
        completed_job_count: row.get::<i32, _>("completed_job_count") as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn create_job(&self, job: &ExportJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO export_jobs
                (id, org_id, request_url, status, job_count, completed_job_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id)
        .bind(&job.org_id)
        .bind(&job.request_url)
        .bind(job.status.as_str())
        .bind(job.job_count as i32)
        .bind(job.completed_job_count as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(org_id = %job.org_id, "created export job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: Uuid) -> Result<ExportJob, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, org_id, request_url, status, job_count, completed_job_count,
                   created_at, updated_at
            FROM export_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

        job_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn set_job_count(&self, job_id: Uuid, count: u32) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE export_jobs
            SET job_count = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'Pending' AND job_count = 0
            "#,
        )
        .bind(job_id)
        .bind(count as i32)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            debug!(%job_id, count, "set job count");
            return Ok(());
        }

        if self.job_exists(job_id).await? {
            Err(StoreError::ConcurrencyConflict(format!(
                "job {job_id} already scheduled"
            )))
        } else {
            Err(StoreError::JobNotFound(job_id))
        }
    }

    #[instrument(skip(self))]
    async fn transition_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let sources: Vec<String> = legal_sources(from, to)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        if sources.is_empty() {
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(job_id)
        .bind(to.as_str())
        .bind(&sources)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            debug!(%job_id, status = %to, "job status changed");
            return Ok(true);
        }

        if self.job_exists(job_id).await? {
            Ok(false)
        } else {
            Err(StoreError::JobNotFound(job_id))
        }
    }

    #[instrument(skip(self, marker), fields(job_id = %marker.job_id, unit_id = %marker.unit_id))]
    async fn record_marker(&self, marker: CompletionMarker) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO export_job_markers (job_id, unit_id, file_name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id, unit_id) DO NOTHING
            "#,
        )
        .bind(marker.job_id)
        .bind(marker.unit_id)
        .bind(&marker.file_name)
        .bind(marker.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to record completion marker: {}", e);
            StoreError::Database(e.to_string())
        })?
        .rows_affected();

        if inserted == 1 {
            sqlx::query(
                r#"
                UPDATE export_jobs
                SET completed_job_count = completed_job_count + 1, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(marker.job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted == 1)
    }

    #[instrument(skip(self))]
    async fn count_markers(&self, job_id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT unit_id) AS markers FROM export_job_markers WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("markers") as u32)
    }

    #[instrument(skip(self))]
    async fn list_markers(&self, job_id: Uuid) -> Result<Vec<CompletionMarker>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, unit_id, file_name, created_at
            FROM export_job_markers
            WHERE job_id = $1
            ORDER BY created_at, unit_id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CompletionMarker {
                job_id: row.get("job_id"),
                unit_id: row.get("unit_id"),
                file_name: row.get("file_name"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
