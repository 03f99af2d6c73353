//! Pure pipeline transformations over intake data.
//!
//! Modules under this namespace must remain free of IO and external side
//! effects so they can be reused across orchestrators and test harnesses.

pub mod classify;
pub mod prompt;
pub mod record;
pub mod validate;

pub use classify::{Classification, Language, Segmentation};
pub use record::{DetectedType, FieldValue, RecordType};
pub use validate::{
    completeness_score, missing_critical_fields, missing_critical_for_values,
    validate_and_normalize, NormalizedExtraction,
};
