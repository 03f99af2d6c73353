//! Deterministic validation and normalization of extracted fields.
//!
//! Everything here is a total function: any input map produces a normalized
//! map, a missing-critical list and a per-field confidence. The model is
//! never trusted for enum correctness, numeric shape or notes completeness;
//! those are all recomputed from fixed rules.

use std::collections::BTreeMap;

use crate::pipeline::record::{enum_values_for, DetectedType, FieldValue, RecordType};
use crate::text::{digits_only, normalize_currency_word};

/// Confidence assigned to a normalized non-empty field when the model gave
/// none. A placeholder signal for UI prioritization, not a calibrated
/// probability.
pub const CONFIDENCE_FILLED: f32 = 0.82;
/// Confidence assigned to an empty field when the model gave none.
pub const CONFIDENCE_EMPTY: f32 = 0.2;
/// Fixed confidence on the single `notes` field of an `other` session.
pub const CONFIDENCE_OTHER_NOTES: f32 = 0.7;

/// Keywords that mark a compound name as also being a searchable area name.
pub const AREA_SYNC_KEYWORDS: &[&str] = &[
    "resort",
    "compound",
    "village",
    "residence",
    "heights",
    "gardens",
    "bay",
    "marina",
];

const STUDIO_NEEDLES: &[&str] = &["studio", "ستوديو", "استوديو"];

/// Feature detectors appended to notes when their needles match the text.
const FEATURE_DETECTORS: &[(&str, &[&str])] = &[
    ("sea view", &["sea view", "فيو بحر", "على البحر", "اطلالة بحر"]),
    ("street view", &["street view", "فيو شارع", "على الشارع"]),
    ("balcony", &["balcony", "بلكونة", "بلكون", "تراس"]),
    ("maintenance", &["maintenance", "صيانة"]),
    (
        "furniture included",
        &["furnished", "مفروشة", "مفروش", "بالفرش"],
    ),
    ("studio", &["studio", "ستوديو", "استوديو"]),
];

/// Result of the deterministic normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedExtraction {
    pub fields: BTreeMap<String, String>,
    pub missing_critical: Vec<String>,
    pub confidence: BTreeMap<String, f32>,
}

/// Normalize extracted fields for the detected type. `model_confidence`
/// carries any per-field confidence the model volunteered; values are
/// clamped into [0, 1].
pub fn validate_and_normalize(
    detected: DetectedType,
    extracted: &BTreeMap<String, String>,
    normalized_text: &str,
    model_confidence: &BTreeMap<String, f32>,
) -> NormalizedExtraction {
    let Some(record_type) = detected.record_type() else {
        // `other` bypasses field rules and keeps only the raw text as notes.
        let mut fields = BTreeMap::new();
        fields.insert("notes".to_string(), normalized_text.trim().to_string());
        let mut confidence = BTreeMap::new();
        confidence.insert("notes".to_string(), CONFIDENCE_OTHER_NOTES);
        return NormalizedExtraction {
            fields,
            missing_critical: Vec::new(),
            confidence,
        };
    };

    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    for &field in record_type.allowed_fields() {
        let raw = extracted.get(field).map(String::as_str).unwrap_or("");
        fields.insert(field.to_string(), normalize_field(record_type, field, raw));
    }

    apply_studio_rule(record_type, extracted, normalized_text, &mut fields);
    sync_location_and_compound(record_type, &mut fields);
    enrich_notes(normalized_text, &mut fields);

    let confidence = field_confidence(&fields, model_confidence);
    let missing_critical = missing_critical_fields(record_type, |field| {
        fields.get(field).map(String::as_str).unwrap_or("")
    });

    NormalizedExtraction {
        fields,
        missing_critical,
        confidence,
    }
}

fn normalize_field(record_type: RecordType, field: &str, raw: &str) -> String {
    let trimmed = raw.trim();
    if record_type.numeric_fields().contains(&field) {
        return digits_only(trimmed);
    }
    if record_type.phone_fields().contains(&field) {
        return digits_only(trimmed);
    }
    if field == "currency" {
        let candidate = normalize_currency_word(trimmed);
        return accept_enum("currency", &candidate);
    }
    if let Some(_values) = enum_values_for(field) {
        return accept_enum(field, &trimmed.to_lowercase());
    }
    trimmed.to_string()
}

/// Lower-cased value if it is on the field's allow-list, empty otherwise.
/// Invalid enum text is discarded, never passed through uncoerced.
fn accept_enum(field: &str, candidate: &str) -> String {
    match enum_values_for(field) {
        Some(values) if values.contains(&candidate) => candidate.to_string(),
        _ => String::new(),
    }
}

fn apply_studio_rule(
    record_type: RecordType,
    extracted: &BTreeMap<String, String>,
    normalized_text: &str,
    fields: &mut BTreeMap<String, String>,
) {
    if !matches!(record_type, RecordType::Sale | RecordType::Rent) {
        return;
    }
    let bedrooms_raw = extracted.get("bedrooms").map(String::as_str).unwrap_or("");
    if mentions_studio(bedrooms_raw) || mentions_studio(normalized_text) {
        fields.insert("bedrooms".to_string(), "0".to_string());
    }
}

fn mentions_studio(text: &str) -> bool {
    let lowered = text.to_lowercase();
    STUDIO_NEEDLES.iter().any(|needle| lowered.contains(needle))
}

fn sync_location_and_compound(record_type: RecordType, fields: &mut BTreeMap<String, String>) {
    if !matches!(record_type, RecordType::Sale | RecordType::Rent) {
        return;
    }
    let location = fields.get("location_area").cloned().unwrap_or_default();
    let compound = fields.get("compound").cloned().unwrap_or_default();
    let joined = [location.as_str(), compound.as_str()]
        .iter()
        .filter(|part| !part.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        return;
    }
    let lowered = joined.to_lowercase();
    if AREA_SYNC_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
    {
        // Compound names double as area names for search, so both fields
        // carry the same joined string.
        let synced = joined.split_whitespace().collect::<Vec<_>>().join(" ");
        fields.insert("location_area".to_string(), synced.clone());
        fields.insert("compound".to_string(), synced);
    }
}

fn enrich_notes(normalized_text: &str, fields: &mut BTreeMap<String, String>) {
    let Some(notes) = fields.get_mut("notes") else {
        return;
    };
    let lowered = normalized_text.to_lowercase();

    let mut parts: Vec<String> = notes
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();

    for (label, needles) in FEATURE_DETECTORS {
        if !needles.iter().any(|needle| lowered.contains(needle)) {
            continue;
        }
        let already = parts
            .iter()
            .any(|part| part.eq_ignore_ascii_case(label));
        if !already {
            parts.push((*label).to_string());
        }
    }

    *notes = parts.join(", ");
}

fn field_confidence(
    fields: &BTreeMap<String, String>,
    model_confidence: &BTreeMap<String, f32>,
) -> BTreeMap<String, f32> {
    fields
        .iter()
        .map(|(field, value)| {
            let score = match model_confidence.get(field) {
                Some(supplied) => supplied.clamp(0.0, 1.0),
                None if value.trim().is_empty() => CONFIDENCE_EMPTY,
                None => CONFIDENCE_FILLED,
            };
            (field.clone(), score)
        })
        .collect()
}

/// Critical fields whose absence forces a session or record into
/// needs_review. The getter abstracts over string maps and sanitized
/// `FieldValue` maps.
pub fn missing_critical_fields<'a, F>(record_type: RecordType, get: F) -> Vec<String>
where
    F: Fn(&str) -> &'a str,
{
    let mut missing = Vec::new();
    match record_type {
        RecordType::Sale | RecordType::Rent => {
            if get("price").trim().is_empty() {
                missing.push("price".to_string());
            }
            if get("location_area").trim().is_empty() {
                missing.push("location_area".to_string());
            }
        }
        RecordType::Buyer => {
            if get("budget_min").trim().is_empty() && get("budget_max").trim().is_empty() {
                missing.push("budget".to_string());
            }
            if get("preferred_areas").trim().is_empty() {
                missing.push("preferred_areas".to_string());
            }
        }
        RecordType::Client => {
            if get("name").trim().is_empty() && get("phone").trim().is_empty() {
                missing.push("contact".to_string());
            }
            if get("client_type").trim().is_empty() {
                missing.push("client_type".to_string());
            }
        }
    }
    missing
}

/// Same critical rules over a sanitized field map (confirmation path).
pub fn missing_critical_for_values(
    record_type: RecordType,
    fields: &BTreeMap<String, FieldValue>,
) -> Vec<String> {
    let rendered: BTreeMap<String, String> = fields
        .iter()
        .map(|(key, value)| (key.clone(), value.display()))
        .collect();
    missing_critical_fields(record_type, |field| {
        rendered.get(field).map(String::as_str).unwrap_or("")
    })
}

/// Share of the type's allowed fields that came out non-empty; stored on the
/// session for review-queue ordering.
pub fn completeness_score(record_type: RecordType, fields: &BTreeMap<String, String>) -> f32 {
    let allowed = record_type.allowed_fields();
    if allowed.is_empty() {
        return 0.0;
    }
    let filled = allowed
        .iter()
        .filter(|field| {
            fields
                .get(**field)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false)
        })
        .count();
    filled as f32 / allowed.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::normalize_text;

    fn extract(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn spec_sale_example_normalizes_all_fields() {
        let extracted = extract(&[
            ("bedrooms", "studio"),
            ("currency", "le"),
            ("contact_phone", "+20 101-555-2222"),
            ("location_area", "Marina Bay"),
            ("compound", ""),
            ("price", "3,500,000"),
        ]);
        let text = normalize_text("studio for sale in Marina Bay 3,500,000 le");
        let outcome =
            validate_and_normalize(DetectedType::Sale, &extracted, &text, &BTreeMap::new());

        assert_eq!(outcome.fields["bedrooms"], "0");
        assert_eq!(outcome.fields["currency"], "egp");
        assert_eq!(outcome.fields["contact_phone"], "201015552222");
        assert!(outcome.fields["compound"].contains("Marina Bay"));
        assert_eq!(outcome.fields["location_area"], outcome.fields["compound"]);
        assert_eq!(outcome.fields["price"], "3500000");
    }

    #[test]
    fn studio_in_text_forces_zero_bedrooms() {
        let extracted = extract(&[("bedrooms", "2")]);
        let text = normalize_text("ستوديو للايجار في المعادي");
        let outcome =
            validate_and_normalize(DetectedType::Rent, &extracted, &text, &BTreeMap::new());
        assert_eq!(outcome.fields["bedrooms"], "0");
    }

    #[test]
    fn numeric_blank_means_unknown_not_zero() {
        let extracted = extract(&[("price", "negotiable"), ("bathrooms", "")]);
        let outcome =
            validate_and_normalize(DetectedType::Sale, &extracted, "flat", &BTreeMap::new());
        assert_eq!(outcome.fields["price"], "");
        assert_eq!(outcome.fields["bathrooms"], "");
        assert!(outcome.missing_critical.contains(&"price".to_string()));
    }

    #[test]
    fn off_list_enums_are_discarded() {
        let extracted = extract(&[
            ("furnished", "Fully Furnished!!"),
            ("rent_period", "Monthly"),
            ("currency", "dollars"),
        ]);
        let outcome =
            validate_and_normalize(DetectedType::Rent, &extracted, "flat", &BTreeMap::new());
        assert_eq!(outcome.fields["furnished"], "");
        assert_eq!(outcome.fields["rent_period"], "monthly");
        assert_eq!(outcome.fields["currency"], "");
    }

    #[test]
    fn location_keyword_syncs_both_fields() {
        for keyword in AREA_SYNC_KEYWORDS {
            let extracted = extract(&[
                ("location_area", &format!("Palm {keyword}")),
                ("compound", ""),
            ]);
            let outcome =
                validate_and_normalize(DetectedType::Sale, &extracted, "x", &BTreeMap::new());
            assert_eq!(
                outcome.fields["location_area"], outcome.fields["compound"],
                "keyword {keyword} must sync"
            );
        }
    }

    #[test]
    fn notes_union_is_deduplicated() {
        let extracted = extract(&[("notes", "balcony, quiet street")]);
        let text = normalize_text("apartment with balcony and sea view, maintenance included");
        let outcome =
            validate_and_normalize(DetectedType::Sale, &extracted, &text, &BTreeMap::new());
        let notes = &outcome.fields["notes"];
        assert_eq!(notes.matches("balcony").count(), 1, "{notes}");
        assert!(notes.contains("sea view"));
        assert!(notes.contains("maintenance"));
        assert!(notes.contains("quiet street"));
    }

    #[test]
    fn confidence_uses_placeholder_heuristic() {
        let extracted = extract(&[("price", "5500000")]);
        let outcome =
            validate_and_normalize(DetectedType::Sale, &extracted, "x", &BTreeMap::new());
        assert_eq!(outcome.confidence["price"], CONFIDENCE_FILLED);
        assert_eq!(outcome.confidence["bathrooms"], CONFIDENCE_EMPTY);
    }

    #[test]
    fn model_confidence_is_clamped_into_unit_interval() {
        let extracted = extract(&[("price", "5500000")]);
        let mut supplied = BTreeMap::new();
        supplied.insert("price".to_string(), 3.5_f32);
        let outcome = validate_and_normalize(DetectedType::Sale, &extracted, "x", &supplied);
        assert_eq!(outcome.confidence["price"], 1.0);
    }

    #[test]
    fn other_keeps_only_notes_at_fixed_confidence() {
        let outcome = validate_and_normalize(
            DetectedType::Other,
            &BTreeMap::new(),
            "hello, anyone selling in maadi?",
            &BTreeMap::new(),
        );
        assert_eq!(outcome.fields.len(), 1);
        assert_eq!(outcome.fields["notes"], "hello, anyone selling in maadi?");
        assert_eq!(outcome.confidence["notes"], CONFIDENCE_OTHER_NOTES);
        assert!(outcome.missing_critical.is_empty());
    }

    #[test]
    fn buyer_criticals_accept_either_budget_bound() {
        let extracted = extract(&[("budget_max", "4000000"), ("preferred_areas", "maadi")]);
        let outcome =
            validate_and_normalize(DetectedType::Buyer, &extracted, "x", &BTreeMap::new());
        assert!(outcome.missing_critical.is_empty(), "{:?}", outcome.missing_critical);

        let outcome = validate_and_normalize(
            DetectedType::Buyer,
            &BTreeMap::new(),
            "x",
            &BTreeMap::new(),
        );
        assert!(outcome.missing_critical.contains(&"budget".to_string()));
        assert!(outcome
            .missing_critical
            .contains(&"preferred_areas".to_string()));
    }

    #[test]
    fn client_criticals_need_contact_and_type() {
        let extracted = extract(&[("phone", "+201001234567")]);
        let outcome =
            validate_and_normalize(DetectedType::Client, &extracted, "x", &BTreeMap::new());
        assert!(!outcome.missing_critical.contains(&"contact".to_string()));
        assert!(outcome.missing_critical.contains(&"client_type".to_string()));
        assert_eq!(outcome.fields["phone"], "201001234567");
    }

    #[test]
    fn completeness_counts_filled_share() {
        let extracted = extract(&[("price", "1000000"), ("location_area", "maadi")]);
        let outcome =
            validate_and_normalize(DetectedType::Sale, &extracted, "x", &BTreeMap::new());
        let score = completeness_score(RecordType::Sale, &outcome.fields);
        assert!(score > 0.0 && score < 1.0, "{score}");
    }
}
