//! PostgreSQL implementation of PopulationRepository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::store::*;
use crate::persistence::StoreError;

/// PostgreSQL implementation of PopulationRepository
///
/// Reads the tables maintained by the importer: `population_snapshots`,
/// `population_members`, and `suppressions`.
#[derive(Clone)]
pub struct PostgresPopulationRepository {
    pool: PgPool,
}

impl PostgresPopulationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn import_status_from_str(s: &str) -> Result<ImportStatus, StoreError> {
    match s {
        "In-Progress" => Ok(ImportStatus::InProgress),
        "Completed" => Ok(ImportStatus::Completed),
        "Failed" => Ok(ImportStatus::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown import status: {other}"
        ))),
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, StoreError> {
    let status: String = row.get("import_status");
    Ok(Snapshot {
        id: row.get("id"),
        org_id: row.get("org_id"),
        category: row.get("category"),
        performance_year: row.get("performance_year"),
        import_status: import_status_from_str(&status)?,
        imported_at: row.get("imported_at"),
    })
}

#[async_trait]
impl PopulationRepository for PostgresPopulationRepository {
    #[instrument(skip(self))]
    async fn get_latest_snapshot(
        &self,
        org_id: &str,
        category: &str,
        status: ImportStatus,
        lower: Option<DateTime<Utc>>,
        upper: Option<DateTime<Utc>>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, org_id, category, performance_year, import_status, imported_at
            FROM population_snapshots
            WHERE org_id = $1
              AND category = $2
              AND import_status = $3
              AND ($4::timestamptz IS NULL OR imported_at >= $4)
              AND ($5::timestamptz IS NULL OR imported_at <= $5)
            ORDER BY imported_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(category)
        .bind(status.as_str())
        .bind(lower)
        .bind(upper)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_member_identifiers(&self, snapshot_id: i64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT member_id
            FROM population_members
            WHERE snapshot_id = $1
            GROUP BY member_id
            ORDER BY MIN(id)
            "#,
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("member_id")).collect())
    }

    #[instrument(skip(self, exclude), fields(excluded = exclude.len()))]
    async fn get_members(
        &self,
        snapshot_id: i64,
        exclude: &[String],
    ) -> Result<Vec<MemberRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, snapshot_id, member_id, legacy_id
            FROM (
                SELECT DISTINCT ON (member_id) id, snapshot_id, member_id, legacy_id
                FROM population_members
                WHERE snapshot_id = $1
                  AND NOT (member_id = ANY($2))
                ORDER BY member_id, id DESC
            ) latest
            ORDER BY id
            "#,
        )
        .bind(snapshot_id)
        .bind(exclude)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| MemberRecord {
                id: row.get("id"),
                snapshot_id: row.get("snapshot_id"),
                member_id: row.get("member_id"),
                legacy_id: row.get("legacy_id"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_suppressed_identifiers(
        &self,
        lookback_days: u32,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT member_id
            FROM (
                SELECT DISTINCT ON (member_id) member_id, preference
                FROM suppressions
                WHERE effective_date >= CURRENT_DATE - $1::int
                ORDER BY member_id, effective_date DESC, id DESC
            ) latest
            WHERE preference = $2
            ORDER BY member_id
            "#,
        )
        .bind(lookback_days as i32)
        .bind(SharingPreference::OptOut.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("member_id")).collect())
    }
}
