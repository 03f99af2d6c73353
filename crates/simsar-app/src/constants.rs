//! Cross-cutting application constants.

/// Default completion model used for classification, extraction and
/// segmentation fallback.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
