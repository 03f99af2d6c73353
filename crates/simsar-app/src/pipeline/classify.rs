//! Model contract for the classification stage.
//!
//! The shapes here are what the completion service is asked to return. They
//! stay pure, provide JSON schema generation for prompting, and clamp any
//! out-of-range values the model produces before downstream code trusts
//! them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{AsRefStr, EnumIter};

use super::record::DetectedType;

/// Language detected for the input text.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Language {
    Ar,
    En,
    #[serde(other)]
    Mixed,
}

impl Default for Language {
    fn default() -> Self {
        Language::Mixed
    }
}

/// Raw classification payload returned by the model for one intake text.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    #[serde(default = "Classification::default_type")]
    pub detected_type: DetectedType,
    /// Percentage confidence; the model is asked for 0-100 but not trusted
    /// to stay in range.
    #[serde(default)]
    pub confidence: i64,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub normalized_text: String,
    #[serde(default)]
    pub signals: Vec<String>,
}

impl Classification {
    fn default_type() -> DetectedType {
        DetectedType::Other
    }

    /// Generate a JSON schema describing this payload for prompting.
    pub fn schema() -> JsonValue {
        let schema = schemars::schema_for!(Classification);
        serde_json::to_value(&schema).expect("schema is serializable")
    }

    /// Confidence clamped into [0, 100] regardless of what the model sent.
    pub fn clamped_confidence(&self) -> u8 {
        self.confidence.clamp(0, 100) as u8
    }
}

/// Model fallback payload for the segmentation stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Segmentation {
    #[serde(default)]
    pub segments: Vec<String>,
}

impl Segmentation {
    pub fn schema() -> JsonValue {
        let schema = schemars::schema_for!(Segmentation);
        serde_json::to_value(&schema).expect("schema is serializable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped_both_ways() {
        let mut classification = Classification {
            detected_type: DetectedType::Sale,
            confidence: 140,
            language: Language::Mixed,
            normalized_text: String::new(),
            signals: Vec::new(),
        };
        assert_eq!(classification.clamped_confidence(), 100);
        classification.confidence = -3;
        assert_eq!(classification.clamped_confidence(), 0);
    }

    #[test]
    fn unknown_type_falls_back_to_other() {
        let parsed: Classification = serde_json::from_str(
            r#"{"detected_type":"warehouse","confidence":55,"language":"ar","normalized_text":"x"}"#,
        )
        .expect("lenient parse");
        assert_eq!(parsed.detected_type, DetectedType::Other);
    }

    #[test]
    fn unknown_language_falls_back_to_mixed() {
        let parsed: Classification = serde_json::from_str(
            r#"{"detected_type":"sale","confidence":10,"language":"fr","normalized_text":"x"}"#,
        )
        .expect("lenient parse");
        assert_eq!(parsed.language, Language::Mixed);
    }

    #[test]
    fn schema_generation_succeeds() {
        assert!(Classification::schema().is_object());
        assert!(Segmentation::schema().is_object());
    }
}
