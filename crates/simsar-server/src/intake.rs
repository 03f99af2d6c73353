use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body for `POST /v1/sessions/{id}/extract`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractRequest {
    /// When set, classification is skipped and extraction runs for this
    /// record type directly.
    #[serde(default)]
    pub forced_type: Option<String>,
}

/// Result of running detection and extraction over an intake session.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractResponse {
    pub session_id: String,
    pub detected_type: String,
    pub confidence: u8,
    pub language: String,
    pub status: String,
    pub completeness: f32,
    pub fields: BTreeMap<String, String>,
    pub missing_critical: Vec<String>,
    pub field_confidence: BTreeMap<String, f32>,
    /// Child session ids when the input was split into multiple listings;
    /// extraction stops at the parent in that case.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub child_sessions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmMode {
    CreateNew,
    UpdateExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    KeepExisting,
    ReplaceWithNew,
    Append,
}

/// Body for `POST /v1/sessions/{id}/confirm`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRequest {
    pub mode: ConfirmMode,
    #[serde(default)]
    pub target_record_id: Option<String>,
    /// Reviewed field map; values may be strings or lists (`preferred_areas`,
    /// `tags`). Unknown keys are dropped by the sanitizer, not rejected.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub merge_decisions: BTreeMap<String, MergeDecision>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaSummary {
    pub images: u32,
    pub videos: u32,
    pub documents: u32,
    pub moved: u32,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmResponse {
    pub record_type: String,
    pub record_id: String,
    pub code: String,
    pub status: String,
    pub changed_fields: Vec<String>,
    pub media: MediaSummary,
    /// Completed orchestration steps, in order. Useful when a confirm
    /// partially failed and needs inspection.
    pub steps: Vec<String>,
}

/// Contract implemented by the intake pipeline and consumed by the router.
#[async_trait]
pub trait IntakeProvider: Send + Sync + 'static {
    async fn extract(
        &self,
        session_id: &str,
        request: ExtractRequest,
        actor: &str,
    ) -> Result<ExtractResponse, IntakeError>;

    async fn confirm(
        &self,
        session_id: &str,
        request: ConfirmRequest,
        actor: &str,
    ) -> Result<ConfirmResponse, IntakeError>;
}

#[derive(Debug, Clone)]
pub struct IntakeError {
    pub kind: IntakeErrorKind,
    pub message: String,
    pub field: Option<String>,
}

#[derive(Debug, Clone)]
pub enum IntakeErrorKind {
    InvalidParameter,
    NotFound { resource: String },
    /// The session was already confirmed; maps to 409.
    Conflict { resource: String },
    /// Model output stayed malformed after the repair attempt; maps to 422.
    Unprocessable,
    RateLimited { retry_after_ms: Option<u64> },
    Internal,
}

impl IntakeError {
    pub fn invalid_param(field: impl Into<String>, message: impl Into<String>) -> Self {
        IntakeError {
            kind: IntakeErrorKind::InvalidParameter,
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>, message: impl Into<String>) -> Self {
        IntakeError {
            kind: IntakeErrorKind::NotFound {
                resource: resource.into(),
            },
            message: message.into(),
            field: None,
        }
    }

    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        IntakeError {
            kind: IntakeErrorKind::Conflict {
                resource: resource.into(),
            },
            message: message.into(),
            field: None,
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        IntakeError {
            kind: IntakeErrorKind::Unprocessable,
            message: message.into(),
            field: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        IntakeError {
            kind: IntakeErrorKind::RateLimited { retry_after_ms },
            message: message.into(),
            field: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        IntakeError {
            kind: IntakeErrorKind::Internal,
            message: message.into(),
            field: None,
        }
    }
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IntakeError {}
