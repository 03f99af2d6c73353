//! Closed record taxonomy for canonical real-estate entities.
//!
//! The four record kinds, their fixed per-kind field sets, the enum value
//! allow-lists and the critical-field rules all live here so the validator,
//! the confirmation sanitizer and the prompt builders agree on one source of
//! truth.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};

/// Canonical record kind; every confirmed entity is exactly one of these.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    EnumIter,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordType {
    Sale,
    Rent,
    Buyer,
    Client,
}

impl RecordType {
    pub fn slug(self) -> &'static str {
        match self {
            RecordType::Sale => "sale",
            RecordType::Rent => "rent",
            RecordType::Buyer => "buyer",
            RecordType::Client => "client",
        }
    }

    /// Prefix used when minting human-readable codes, e.g. `SALE-2025-00017`.
    pub fn code_prefix(self) -> &'static str {
        match self {
            RecordType::Sale => "SALE",
            RecordType::Rent => "RENT",
            RecordType::Buyer => "BUYER",
            RecordType::Client => "CLIENT",
        }
    }

    /// The fixed extraction field set for this kind: exactly these keys are
    /// requested from the model and accepted by the sanitizer.
    pub fn allowed_fields(self) -> &'static [&'static str] {
        match self {
            RecordType::Sale => SALE_FIELDS,
            RecordType::Rent => RENT_FIELDS,
            RecordType::Buyer => BUYER_FIELDS,
            RecordType::Client => CLIENT_FIELDS,
        }
    }

    /// Fields reduced to digit-only strings during normalization.
    pub fn numeric_fields(self) -> &'static [&'static str] {
        match self {
            RecordType::Sale => &["price", "size_sqm", "bedrooms", "bathrooms", "floor"],
            RecordType::Rent => &["price", "size_sqm", "bedrooms", "bathrooms", "floor"],
            RecordType::Buyer => &["budget_min", "budget_max", "bedrooms_needed"],
            RecordType::Client => &[],
        }
    }

    /// Fields holding phone numbers, normalized to digits.
    pub fn phone_fields(self) -> &'static [&'static str] {
        match self {
            RecordType::Client => &["phone"],
            _ => &["contact_phone"],
        }
    }

    /// Fields that may arrive either comma-joined or already list-shaped.
    pub fn list_fields(self) -> &'static [&'static str] {
        match self {
            RecordType::Buyer => &["preferred_areas", "tags"],
            _ => &["tags"],
        }
    }
}

const SALE_FIELDS: &[&str] = &[
    "code",
    "property_type",
    "price",
    "currency",
    "size_sqm",
    "bedrooms",
    "bathrooms",
    "location_area",
    "compound",
    "floor",
    "furnished",
    "finishing",
    "payment_terms",
    "contact_name",
    "contact_phone",
    "notes",
];

const RENT_FIELDS: &[&str] = &[
    "code",
    "property_type",
    "price",
    "currency",
    "size_sqm",
    "bedrooms",
    "bathrooms",
    "location_area",
    "compound",
    "floor",
    "furnished",
    "finishing",
    "payment_terms",
    "rent_period",
    "contact_name",
    "contact_phone",
    "notes",
];

const BUYER_FIELDS: &[&str] = &[
    "code",
    "intent",
    "budget_min",
    "budget_max",
    "currency",
    "preferred_areas",
    "property_type",
    "bedrooms_needed",
    "move_timeline",
    "contact_name",
    "contact_phone",
    "notes",
];

const CLIENT_FIELDS: &[&str] = &["code", "client_type", "name", "phone", "area", "notes"];

/// Values accepted for the `furnished` enum field.
pub const FURNISHED_VALUES: &[&str] = &["yes", "no", "semi"];
/// Values accepted for the `rent_period` enum field.
pub const RENT_PERIOD_VALUES: &[&str] = &["daily", "weekly", "monthly", "yearly"];
/// Values accepted for the buyer `intent` enum field.
pub const INTENT_VALUES: &[&str] = &["buy", "rent"];
/// Values accepted for the `client_type` enum field.
pub const CLIENT_TYPE_VALUES: &[&str] = &["owner", "buyer", "seller", "tenant"];
/// Values accepted for the `currency` enum field.
pub const CURRENCY_VALUES: &[&str] = &["egp", "usd", "eur", "sar", "aed"];

/// Allow-list for a given enum-shaped field, if the field is one.
pub fn enum_values_for(field: &str) -> Option<&'static [&'static str]> {
    match field {
        "furnished" => Some(FURNISHED_VALUES),
        "rent_period" => Some(RENT_PERIOD_VALUES),
        "intent" => Some(INTENT_VALUES),
        "client_type" => Some(CLIENT_TYPE_VALUES),
        "currency" => Some(CURRENCY_VALUES),
        _ => None,
    }
}

/// Outcome of classification; `Other` bypasses extraction entirely.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetectedType {
    Sale,
    Rent,
    Buyer,
    Client,
    #[serde(other)]
    Other,
}

impl DetectedType {
    pub fn record_type(self) -> Option<RecordType> {
        match self {
            DetectedType::Sale => Some(RecordType::Sale),
            DetectedType::Rent => Some(RecordType::Rent),
            DetectedType::Buyer => Some(RecordType::Buyer),
            DetectedType::Client => Some(RecordType::Client),
            DetectedType::Other => None,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            DetectedType::Sale => "sale",
            DetectedType::Rent => "rent",
            DetectedType::Buyer => "buyer",
            DetectedType::Client => "client",
            DetectedType::Other => "other",
        }
    }
}

impl From<RecordType> for DetectedType {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::Sale => DetectedType::Sale,
            RecordType::Rent => DetectedType::Rent,
            RecordType::Buyer => DetectedType::Buyer,
            RecordType::Client => DetectedType::Client,
        }
    }
}

/// A sanitized canonical-record field value. Externally tagged on purpose so
/// the store's bincode encoding round-trips without `deserialize_any`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            FieldValue::List(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(value) => value.trim().is_empty(),
            FieldValue::List(values) => values.iter().all(|v| v.trim().is_empty()),
        }
    }

    /// Canonical string form used for merge comparison and timeline diffs.
    pub fn display(&self) -> String {
        match self {
            FieldValue::Text(value) => value.clone(),
            FieldValue::List(values) => values.join(", "),
        }
    }
}
