//! Output artifacts
//!
//! Each job writes one newline-delimited result file per organization and
//! resource type, plus a parallel error file of [`OperationOutcome`] lines:
//!
//! ```text
//! {payload_dir}/{job_id}/{org_id}-{ResourceType}.ndjson
//! {payload_dir}/{job_id}/{org_id}-{ResourceType}-error.ndjson
//! ```

mod arbiter;
mod ndjson;
mod outcome;

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::model::ResourceType;

pub use arbiter::{ArtifactArbiter, OutputError};
pub use ndjson::ndjson_entries;
pub use outcome::{OperationOutcome, Severity, INTERNAL_ERROR, RETRIEVAL_ERROR};

/// File name of the result artifact
pub fn artifact_name(org_id: &str, resource_type: ResourceType) -> String {
    format!("{org_id}-{resource_type}.ndjson")
}

/// File name of the error artifact
pub fn error_artifact_name(org_id: &str, resource_type: ResourceType) -> String {
    format!("{org_id}-{resource_type}-error.ndjson")
}

/// Directory holding every artifact of a job
pub fn job_dir(payload_dir: &Path, job_id: Uuid) -> PathBuf {
    payload_dir.join(job_id.to_string())
}
