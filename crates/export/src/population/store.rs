//! PopulationRepository trait definition

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::StoreError;

/// Import state of a population snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportStatus {
    InProgress,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "In-Progress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

/// Source file category a snapshot was imported from
pub const CATEGORY_ATTRIBUTION: &str = "attribution";

/// One import of a beneficiary list for an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub org_id: String,
    pub category: String,
    pub performance_year: i32,
    pub import_status: ImportStatus,
    pub imported_at: DateTime<Utc>,
}

/// A beneficiary row belonging to one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Row key; not stable across snapshots
    pub id: i64,
    pub snapshot_id: i64,
    /// Stable member identifier used for diffing
    pub member_id: String,
    pub legacy_id: Option<String>,
}

/// Data-sharing preference recorded by a suppression entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharingPreference {
    OptIn,
    OptOut,
}

impl SharingPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptIn => "Y",
            Self::OptOut => "N",
        }
    }
}

/// A member's data-sharing preference as of an effective date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub member_id: String,
    pub effective_date: NaiveDate,
    pub preference: SharingPreference,
}

/// Read contract over imported population data
///
/// The importer owns the data; the pipeline never writes through this trait.
#[async_trait]
pub trait PopulationRepository: Send + Sync + 'static {
    /// Most recent snapshot for `org_id` matching `category` and `status`
    /// whose import time lies within `[lower, upper]`
    ///
    /// Either bound may be `None` for an open interval.
    async fn get_latest_snapshot(
        &self,
        org_id: &str,
        category: &str,
        status: ImportStatus,
        lower: Option<DateTime<Utc>>,
        upper: Option<DateTime<Utc>>,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Member identifiers present in a snapshot
    async fn get_member_identifiers(&self, snapshot_id: i64) -> Result<Vec<String>, StoreError>;

    /// Members of a snapshot, excluding `exclude`
    ///
    /// Rows repeating a member id are collapsed, the latest row winning.
    /// Results are ordered by row id.
    async fn get_members(
        &self,
        snapshot_id: i64,
        exclude: &[String],
    ) -> Result<Vec<MemberRecord>, StoreError>;

    /// Members whose latest suppression entry within the lookback window is
    /// an opt-out
    async fn get_suppressed_identifiers(
        &self,
        lookback_days: u32,
    ) -> Result<Vec<String>, StoreError>;
}
