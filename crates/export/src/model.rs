//! Domain types shared across the pipeline
//!
//! Export jobs, their status state machine, resource types, and the
//! `since` filter carried by diff-mode requests.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExportError;

// ============================================================================
// Resource types
// ============================================================================

/// Clinical resource category a work unit retrieves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Coverage,
    ExplanationOfBenefit,
}

impl ResourceType {
    /// Default request scope when the client names no types
    pub const ALL: [ResourceType; 3] = [
        ResourceType::Patient,
        ResourceType::ExplanationOfBenefit,
        ResourceType::Coverage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "Patient",
            Self::Coverage => "Coverage",
            Self::ExplanationOfBenefit => "ExplanationOfBenefit",
        }
    }

    /// Parse a comma-separated `_type` list, defaulting to [`ResourceType::ALL`]
    pub fn parse_list(raw: &str) -> Result<Vec<ResourceType>, ExportError> {
        let mut types = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parsed: ResourceType = part.parse()?;
            if !types.contains(&parsed) {
                types.push(parsed);
            }
        }
        if types.is_empty() {
            return Ok(Self::ALL.to_vec());
        }
        Ok(types)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Patient" => Ok(Self::Patient),
            "Coverage" => Ok(Self::Coverage),
            "ExplanationOfBenefit" => Ok(Self::ExplanationOfBenefit),
            other => Err(ExportError::InvalidResourceType(other.to_string())),
        }
    }
}

// ============================================================================
// Job status
// ============================================================================

/// Export job status
///
/// Moves forward only: `Pending -> In Progress -> {Completed, Failed}`, with
/// `Archived` reachable from the terminal states by the retention process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Failed,
    Archived,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Archived => "Archived",
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Completed)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Completed, Archived)
                | (Failed, Archived)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Archived)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "In Progress" => Ok(Self::InProgress),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Archived" => Ok(Self::Archived),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ============================================================================
// Export job
// ============================================================================

/// One client-initiated export request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub org_id: String,
    pub request_url: String,
    pub status: JobStatus,
    /// Total work units produced by the splitter; zero until scheduled
    pub job_count: u32,
    /// Distinct completion markers observed so far
    pub completed_job_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportJob {
    pub fn new(org_id: impl Into<String>, request_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            org_id: org_id.into(),
            request_url: request_url.into(),
            status: JobStatus::Pending,
            job_count: 0,
            completed_job_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn percent_complete(&self) -> u8 {
        if self.status == JobStatus::Completed {
            return 100;
        }
        if self.job_count == 0 {
            return 0;
        }
        let pct = u64::from(self.completed_job_count) * 100 / u64::from(self.job_count);
        pct.min(100) as u8
    }

    /// Human-readable status, e.g. `In Progress (24%)`
    pub fn status_message(&self) -> String {
        if self.status == JobStatus::InProgress && self.job_count > 0 {
            format!("{} ({}%)", self.status, self.percent_complete())
        } else {
            self.status.to_string()
        }
    }
}

/// Snapshot of a job's progress returned to pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub percent_complete: u8,
    pub message: String,
}

impl From<&ExportJob> for JobStatusReport {
    fn from(job: &ExportJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            percent_complete: job.percent_complete(),
            message: job.status_message(),
        }
    }
}

// ============================================================================
// Since filter
// ============================================================================

/// An RFC 3339 instant that keeps the client's original spelling
///
/// The upstream filter is built from the original text so that
/// `2020-02-13T08:00:00.000-05:00` becomes `gt2020-02-13T08:00:00.000-05:00`
/// byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Since {
    raw: String,
    instant: DateTime<FixedOffset>,
}

impl Since {
    pub fn parse(raw: &str) -> Result<Self, ExportError> {
        let instant = DateTime::parse_from_rfc3339(raw.trim())
            .map_err(|e| ExportError::InvalidSince(format!("{raw}: {e}")))?;
        Ok(Self {
            raw: raw.trim().to_string(),
            instant,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.instant.with_timezone(&Utc)
    }

    /// Upstream filter meaning "only changes after this instant"
    pub fn filter(&self) -> String {
        format!("gt{}", self.raw)
    }
}

impl FromStr for Since {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Organization identifiers
// ============================================================================

fn org_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Shared-savings, next-generation, and kidney-care program formats
    PATTERN.get_or_init(|| Regex::new(r"^(A\d{4}|V\d{3}|E\d{4})$").expect("static pattern"))
}

/// Whether `org_id` has one of the supported program identifier formats
pub fn is_supported_org(org_id: &str) -> bool {
    org_pattern().is_match(org_id)
}
