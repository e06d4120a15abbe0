//! In-memory implementation of PopulationRepository for testing

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use parking_lot::RwLock;

use super::store::*;
use crate::persistence::StoreError;

#[derive(Default)]
struct PopulationState {
    snapshots: Vec<Snapshot>,
    members: Vec<MemberRecord>,
    suppressions: Vec<SuppressionEntry>,
    next_snapshot_id: i64,
    next_member_id: i64,
}

/// In-memory implementation of PopulationRepository
///
/// Stands in for the importer: tests seed snapshots, members, and
/// suppression entries directly.
pub struct InMemoryPopulationRepository {
    state: RwLock<PopulationState>,
}

impl InMemoryPopulationRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PopulationState {
                next_snapshot_id: 1,
                next_member_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Add a completed attribution snapshot with the given members
    pub fn insert_snapshot<I, S>(
        &self,
        org_id: &str,
        imported_at: DateTime<Utc>,
        member_ids: I,
    ) -> i64
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert_snapshot_with_status(org_id, imported_at, ImportStatus::Completed, member_ids)
    }

    /// Add a snapshot in an arbitrary import state
    pub fn insert_snapshot_with_status<I, S>(
        &self,
        org_id: &str,
        imported_at: DateTime<Utc>,
        status: ImportStatus,
        member_ids: I,
    ) -> i64
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write();
        let snapshot_id = state.next_snapshot_id;
        state.next_snapshot_id += 1;

        state.snapshots.push(Snapshot {
            id: snapshot_id,
            org_id: org_id.to_string(),
            category: CATEGORY_ATTRIBUTION.to_string(),
            performance_year: imported_at.year(),
            import_status: status,
            imported_at,
        });

        for member_id in member_ids {
            let id = state.next_member_id;
            state.next_member_id += 1;
            let member_id = member_id.into();
            state.members.push(MemberRecord {
                id,
                snapshot_id,
                legacy_id: Some(format!("L{member_id}")),
                member_id,
            });
        }

        snapshot_id
    }

    /// Record a suppression entry
    pub fn insert_suppression(
        &self,
        member_id: &str,
        effective_date: NaiveDate,
        preference: SharingPreference,
    ) {
        self.state.write().suppressions.push(SuppressionEntry {
            member_id: member_id.to_string(),
            effective_date,
            preference,
        });
    }
}

impl Default for InMemoryPopulationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PopulationRepository for InMemoryPopulationRepository {
    async fn get_latest_snapshot(
        &self,
        org_id: &str,
        category: &str,
        status: ImportStatus,
        lower: Option<DateTime<Utc>>,
        upper: Option<DateTime<Utc>>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let state = self.state.read();
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.org_id == org_id && s.category == category && s.import_status == status)
            .filter(|s| lower.map(|l| s.imported_at >= l).unwrap_or(true))
            .filter(|s| upper.map(|u| s.imported_at <= u).unwrap_or(true))
            .max_by_key(|s| (s.imported_at, s.id))
            .cloned())
    }

    async fn get_member_identifiers(&self, snapshot_id: i64) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        Ok(state
            .members
            .iter()
            .filter(|m| m.snapshot_id == snapshot_id)
            .filter(|m| seen.insert(m.member_id.clone()))
            .map(|m| m.member_id.clone())
            .collect())
    }

    async fn get_members(
        &self,
        snapshot_id: i64,
        exclude: &[String],
    ) -> Result<Vec<MemberRecord>, StoreError> {
        let state = self.state.read();
        let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();

        let mut latest: HashMap<&str, &MemberRecord> = HashMap::new();
        for member in state.members.iter().filter(|m| m.snapshot_id == snapshot_id) {
            if exclude.contains(member.member_id.as_str()) {
                continue;
            }
            let slot = latest.entry(member.member_id.as_str()).or_insert(member);
            if member.id > slot.id {
                *slot = member;
            }
        }

        let mut members: Vec<MemberRecord> = latest.into_values().cloned().collect();
        members.sort_by_key(|m| m.id);
        Ok(members)
    }

    async fn get_suppressed_identifiers(
        &self,
        lookback_days: u32,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let since = (Utc::now() - Duration::days(i64::from(lookback_days))).date_naive();

        let mut latest: HashMap<&str, &SuppressionEntry> = HashMap::new();
        for entry in state.suppressions.iter().filter(|e| e.effective_date >= since) {
            let slot = latest.entry(entry.member_id.as_str()).or_insert(entry);
            if entry.effective_date >= slot.effective_date {
                *slot = entry;
            }
        }

        let mut suppressed: Vec<String> = latest
            .into_values()
            .filter(|e| e.preference == SharingPreference::OptOut)
            .map(|e| e.member_id.clone())
            .collect();
        suppressed.sort();
        Ok(suppressed)
    }
}
