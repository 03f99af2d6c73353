//! Prompt construction utilities for the classification, extraction and
//! segmentation stages.
//!
//! These helpers stay pure and generate the message pairs and schema
//! payloads sent to the completion service.

use serde_json::Value as JsonValue;
use strum::IntoEnumIterator;

use super::classify::{Classification, Language, Segmentation};
use super::record::{
    DetectedType, RecordType, CLIENT_TYPE_VALUES, CURRENCY_VALUES, FURNISHED_VALUES,
    INTENT_VALUES, RENT_PERIOD_VALUES,
};

/// System/user message pair for a single model call.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system_message: String,
    pub user_message: String,
}

pub(crate) const REPAIR_SYSTEM_PROMPT: &str = "You repair malformed model output. \
    Respond with exactly one strict JSON object and nothing else: no markdown, \
    no commentary, no trailing text.";

/// Build the repair user message for output that failed to parse as JSON.
pub fn build_repair_prompt(raw_output: &str) -> Prompt {
    Prompt {
        system_message: REPAIR_SYSTEM_PROMPT.to_string(),
        user_message: format!(
            "The following response was supposed to be a single strict JSON object \
             but failed to parse. Fix it into strict JSON, keeping every key and \
             value that can be salvaged:\n\n{raw_output}"
        ),
    }
}

pub fn build_classification_prompt(text: &str) -> Prompt {
    let schema = Classification::schema();
    let schema_pretty = pretty_schema(&schema);

    let types = enum_list(DetectedType::iter().map(|v| v.as_ref().to_string()).collect());
    let languages = enum_list(Language::iter().map(|v| v.as_ref().to_string()).collect());

    let system_message = "You classify multilingual (Arabic/English/mixed) real-estate \
        intake messages. You answer with exactly one JSON object matching the given \
        schema, with no markdown and no extra text."
        .to_string();

    let user_message = format!(
        "Classify the following message.\n\
         Guidelines:\n\
         \x20 * `detected_type` must be one of: {types}. Use `other` when the text is not a listing, a buyer requirement or a client contact.\n\
         \x20 * `confidence` is an integer 0-100.\n\
         \x20 * `language` must be one of: {languages}.\n\
         \x20 * `normalized_text` is the message with obvious noise removed; do not translate.\n\
         \x20 * `signals` lists short phrases that drove the decision.\n\n\
         JSON schema:\n{schema_pretty}\n\nMessage:\n```text\n{text}\n```"
    );

    Prompt {
        system_message,
        user_message,
    }
}

pub fn build_extraction_prompt(record_type: RecordType, text: &str) -> Prompt {
    let fields = record_type.allowed_fields().join(", ");
    let guidelines = extraction_guidelines(record_type);

    let system_message = "You extract structured fields from multilingual real-estate \
        text. You answer with exactly one flat JSON object whose keys are the \
        requested field names and whose values are strings. No markdown, no extra \
        keys, no commentary."
        .to_string();

    let user_message = format!(
        "Extract the `{}` field set from the text below. Return a JSON object with \
         exactly these keys (use \"\" when unknown, never omit a key):\n{fields}\n\n\
         Guidelines:\n{guidelines}\n\nText:\n```text\n{text}\n```",
        record_type.slug()
    );

    Prompt {
        system_message,
        user_message,
    }
}

pub fn build_segmentation_prompt(text: &str) -> Prompt {
    let schema = Segmentation::schema();
    let schema_pretty = pretty_schema(&schema);

    let system_message = "You split real-estate intake messages that describe several \
        listings into one segment per listing. You answer with exactly one JSON \
        object matching the given schema."
        .to_string();

    let user_message = format!(
        "If the text below describes more than one listing, return each listing as \
         its own segment, preserving the original wording. If it is a single \
         listing, return a single segment.\n\nJSON schema:\n{schema_pretty}\n\n\
         Text:\n```text\n{text}\n```"
    );

    Prompt {
        system_message,
        user_message,
    }
}

fn extraction_guidelines(record_type: RecordType) -> String {
    let mut items: Vec<String> = Vec::new();
    items.push("- Copy numbers as written; do not convert units or currencies.".to_string());
    items.push(format!(
        "- `currency` should be one of: {}.",
        CURRENCY_VALUES.join(", ")
    ));
    match record_type {
        RecordType::Sale | RecordType::Rent => {
            items.push(format!(
                "- `furnished` should be one of: {}.",
                FURNISHED_VALUES.join(", ")
            ));
            items.push(
                "- `location_area` is the district or city area; `compound` is the named development if any."
                    .to_string(),
            );
            if record_type == RecordType::Rent {
                items.push(format!(
                    "- `rent_period` should be one of: {}.",
                    RENT_PERIOD_VALUES.join(", ")
                ));
            }
        }
        RecordType::Buyer => {
            items.push(format!(
                "- `intent` should be one of: {}.",
                INTENT_VALUES.join(", ")
            ));
            items.push(
                "- `preferred_areas` is a single comma-joined string of area names.".to_string(),
            );
        }
        RecordType::Client => {
            items.push(format!(
                "- `client_type` should be one of: {}.",
                CLIENT_TYPE_VALUES.join(", ")
            ));
        }
    }
    items.push("- `contact_phone`/`phone` keeps the number as written, digits and symbols.".to_string());
    items.push("- `notes` collects anything meaningful that fits no other field.".to_string());

    items
        .into_iter()
        .map(|line| format!("  * {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn enum_list(values: Vec<String>) -> String {
    values.join(", ")
}

fn pretty_schema(schema: &JsonValue) -> String {
    serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_prompt_embeds_schema_and_types() {
        let prompt = build_classification_prompt("شقة للبيع في التجمع");
        assert!(prompt.user_message.contains("detected_type"));
        assert!(prompt.user_message.contains("other"));
        assert!(prompt.user_message.contains("شقة للبيع"));
    }

    #[test]
    fn extraction_prompt_lists_exact_field_set() {
        let prompt = build_extraction_prompt(RecordType::Rent, "flat for rent");
        for field in RecordType::Rent.allowed_fields() {
            assert!(
                prompt.user_message.contains(field),
                "missing field {field} in prompt"
            );
        }
        assert!(prompt.user_message.contains("rent_period"));

        let sale = build_extraction_prompt(RecordType::Sale, "flat for sale");
        assert!(!sale.user_message.contains("rent_period"));
    }

    #[test]
    fn repair_prompt_carries_the_bad_output() {
        let prompt = build_repair_prompt("{\"price\": 5");
        assert!(prompt.user_message.contains("{\"price\": 5"));
        assert!(prompt.system_message.contains("strict JSON"));
    }
}
