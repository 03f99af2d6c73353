use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::pipeline::prompt::build_extraction_prompt;
use crate::pipeline::record::DetectedType;
use crate::services::model::{complete_json, CompleteJsonError, CompletionClient, ModelError};

/// Pulls the fixed per-type field set out of normalized text via the
/// completion service.
#[derive(Clone)]
pub struct Extractor {
    client: Arc<dyn CompletionClient>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("extraction output was not valid JSON after one repair attempt")]
    Parse { raw: String },
}

impl Extractor {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// Extract raw field strings for the detected type. `other` performs no
    /// model call and yields an empty map. Keys outside the type's field
    /// set are dropped; enum-shaped values are free text here and get
    /// re-validated downstream.
    pub async fn extract(
        &self,
        detected: DetectedType,
        normalized_text: &str,
    ) -> Result<BTreeMap<String, String>, ExtractError> {
        let Some(record_type) = detected.record_type() else {
            return Ok(BTreeMap::new());
        };

        let prompt = build_extraction_prompt(record_type, normalized_text);
        let payload: JsonMap<String, JsonValue> = complete_json(&self.client, &prompt)
            .await
            .map_err(|err| match err {
                CompleteJsonError::Model(model) => ExtractError::Model(model),
                CompleteJsonError::Parse { raw, .. } => ExtractError::Parse { raw },
            })?;

        let mut fields = BTreeMap::new();
        for &field in record_type.allowed_fields() {
            let value = payload.get(field).map(stringify).unwrap_or_default();
            fields.insert(field.to_string(), value);
        }

        tracing::debug!(
            record_type = record_type.slug(),
            filled = fields.values().filter(|v| !v.is_empty()).count(),
            "extracted field set"
        );
        Ok(fields)
    }
}

/// Field values come back as strings, but the model occasionally emits bare
/// numbers or booleans; accept those rather than failing the whole payload.
fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.trim().to_string(),
        JsonValue::Number(number) => number.to_string(),
        JsonValue::Bool(flag) => flag.to_string(),
        JsonValue::Null => String::new(),
        JsonValue::Array(items) => items
            .iter()
            .map(stringify)
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(_) => String::new(),
    }
}
