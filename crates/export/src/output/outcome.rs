//! Structured per-member failure records

use serde::{Deserialize, Serialize};

use crate::model::ResourceType;

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Information,
}

/// Detail code for retrieval failures
pub const RETRIEVAL_ERROR: &str = "Retrieval Error";

/// Detail code for failures handling a retrieved payload
pub const INTERNAL_ERROR: &str = "Internal Error";

/// One isolated failure, written as a line of the error artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub severity: Severity,
    pub code: String,
    pub detail_code: String,
    pub detail_message: String,
}

impl OperationOutcome {
    pub fn exception(detail_code: &str, detail_message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: "exception".to_string(),
            detail_code: detail_code.to_string(),
            detail_message: detail_message.into(),
        }
    }

    /// The upstream client failed for one member
    pub fn retrieval_failed(resource_type: ResourceType, member_id: &str, org_id: &str) -> Self {
        Self::exception(
            RETRIEVAL_ERROR,
            format!(
                "Error retrieving {resource_type} for beneficiary {member_id} in organization {org_id}"
            ),
        )
    }

    /// The upstream payload for one member could not be decoded
    pub fn payload_unreadable(resource_type: ResourceType, member_id: &str, org_id: &str) -> Self {
        Self::exception(
            INTERNAL_ERROR,
            format!(
                "Error reading {resource_type} data for beneficiary {member_id} in organization {org_id}"
            ),
        )
    }

    /// Compact single-line JSON
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
