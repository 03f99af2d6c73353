//! Confirmation orchestration: the top-level writer that turns a reviewed
//! intake session into a canonical record.
//!
//! The step sequence is deliberately not one transaction. Each completed
//! step is appended to an explicit trace so a failure partway leaves an
//! inspectable, re-visitable state instead of rolling back the record.
//! Media trouble after the record exists is downgraded to timeline
//! warnings.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::pipeline::record::{enum_values_for, FieldValue, RecordType};
use crate::pipeline::validate::missing_critical_for_values;
use crate::services::context::{PipelineContext, PipelineError, PipelineResult};
use crate::services::media::{record_media_path, sanitize_filename, MediaObjectStore};
use crate::services::store::{
    CanonicalRecord, MediaOwner, MediaType, RecordRef, RecordStatus, SessionStatus,
    TimelineEvent, TimelineEventKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    CreateNew,
    UpdateExisting,
}

/// Per-field instruction governing how new data combines with an existing
/// record's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    KeepExisting,
    ReplaceWithNew,
    Append,
}

/// Input to the confirm operation.
#[derive(Debug, Clone)]
pub struct ConfirmCommand {
    pub session_id: String,
    pub mode: ConfirmMode,
    pub target_record_id: Option<String>,
    /// Reviewer override for the record type; falls back to the session's
    /// detected type.
    pub record_type: Option<RecordType>,
    pub fields: BTreeMap<String, JsonValue>,
    pub merge_decisions: BTreeMap<String, MergeDecision>,
}

/// Completed orchestration steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStep {
    ContactResolved,
    RecordCreated,
    RecordMerged,
    MediaMigrated,
    TimelineRecorded,
    SessionConfirmed,
}

impl ConfirmStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmStep::ContactResolved => "contact_resolved",
            ConfirmStep::RecordCreated => "record_created",
            ConfirmStep::RecordMerged => "record_merged",
            ConfirmStep::MediaMigrated => "media_migrated",
            ConfirmStep::TimelineRecorded => "timeline_recorded",
            ConfirmStep::SessionConfirmed => "session_confirmed",
        }
    }
}

/// Tally of the media migration, warnings included.
#[derive(Debug, Clone, Default)]
pub struct MediaMigration {
    pub images: u32,
    pub videos: u32,
    pub documents: u32,
    pub moved: u32,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub record_type: RecordType,
    pub record_id: String,
    pub code: String,
    pub status: RecordStatus,
    pub changed_fields: Vec<String>,
    pub media: MediaMigration,
    pub steps: Vec<ConfirmStep>,
}

/// Confirm a session into a canonical record. Preconditions (session
/// exists, not already confirmed, valid target for updates) are checked
/// before any write occurs.
pub async fn confirm(ctx: &PipelineContext, cmd: ConfirmCommand) -> PipelineResult<ConfirmOutcome> {
    let session = ctx.store.require_session(&cmd.session_id)?;
    if session.status == SessionStatus::Confirmed {
        return Err(PipelineError::AlreadyConfirmed(session.id.clone()));
    }

    let record_type = cmd
        .record_type
        .or(session.confirmed_type)
        .or_else(|| session.detected_type.and_then(|detected| detected.record_type()))
        .ok_or_else(|| {
            PipelineError::invalid("session has no confirmable record type; force one explicitly")
        })?;

    let sanitized = sanitize_fields(record_type, &cmd.fields);
    let mut steps = Vec::new();

    // Target record is validated before anything is written.
    let existing = match cmd.mode {
        ConfirmMode::CreateNew => None,
        ConfirmMode::UpdateExisting => {
            let target_id = cmd.target_record_id.as_deref().ok_or_else(|| {
                PipelineError::invalid("update_existing requires target_record_id")
            })?;
            let record = ctx.store.get_record(target_id)?.ok_or_else(|| {
                PipelineError::RecordNotFound {
                    record_type: record_type.slug().to_string(),
                    record_id: target_id.to_string(),
                }
            })?;
            if record.record_type != record_type {
                return Err(PipelineError::invalid(format!(
                    "target record is a {}, not a {}",
                    record.record_type.slug(),
                    record_type.slug()
                )));
            }
            Some(record)
        }
    };

    let contact = resolve_contact(ctx, record_type, &sanitized)?;
    if contact.is_some() {
        steps.push(ConfirmStep::ContactResolved);
    }

    let missing_critical = missing_critical_for_values(record_type, &sanitized);
    let status = if missing_critical.is_empty() {
        RecordStatus::Active
    } else {
        RecordStatus::NeedsReview
    };

    let (record, changed_fields) = match existing {
        None => {
            let code = ctx.store.allocate_code(record_type)?;
            let now_ms = crate::services::store::current_timestamp_ms();
            let record = CanonicalRecord {
                id: Uuid::new_v4().to_string(),
                record_type,
                code,
                status,
                contact_id: contact.as_ref().map(|c| c.id.clone()),
                session_id: Some(session.id.clone()),
                fields: sanitized.clone(),
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            };
            ctx.store.put_record(&record)?;
            ctx.store.append_event(TimelineEvent::for_record(
                record_ref(&record),
                TimelineEventKind::Created,
            ))?;
            steps.push(ConfirmStep::RecordCreated);
            let written: Vec<String> = sanitized.keys().cloned().collect();
            (record, written)
        }
        Some(mut record) => {
            let changed = merge_fields(
                &mut record.fields,
                &sanitized,
                &cmd.merge_decisions,
            );
            record.status = status;
            if record.contact_id.is_none() {
                record.contact_id = contact.as_ref().map(|c| c.id.clone());
            }
            record.updated_at_ms = crate::services::store::current_timestamp_ms();
            ctx.store.put_record(&record)?;
            ctx.store.append_event(TimelineEvent::for_record(
                record_ref(&record),
                TimelineEventKind::Updated {
                    changed: changed.clone(),
                },
            ))?;
            steps.push(ConfirmStep::RecordMerged);
            (record, changed)
        }
    };

    let media = migrate_session_media(ctx, &session.id, &record).await?;
    steps.push(ConfirmStep::MediaMigrated);

    ctx.store.append_event(TimelineEvent::for_record(
        record_ref(&record),
        TimelineEventKind::MediaAttached {
            images: media.images,
            videos: media.videos,
            documents: media.documents,
            has_warnings: !media.warnings.is_empty(),
        },
    ))?;
    if !media.warnings.is_empty() {
        ctx.store.append_event(TimelineEvent::for_record(
            record_ref(&record),
            TimelineEventKind::MediaMoveWarning {
                warnings: media.warnings.clone(),
            },
        ))?;
    }
    steps.push(ConfirmStep::TimelineRecorded);

    // Terminal transition; a concurrent confirm loses here and no record
    // write of ours is rolled back.
    ctx.store
        .confirm_session(&session.id, record_ref(&record), missing_critical)?;
    steps.push(ConfirmStep::SessionConfirmed);

    tracing::info!(
        session_id = %session.id,
        record_id = %record.id,
        code = %record.code,
        status = record.status.as_str(),
        warnings = media.warnings.len(),
        "session confirmed"
    );

    Ok(ConfirmOutcome {
        record_type,
        record_id: record.id,
        code: record.code,
        status: record.status,
        changed_fields,
        media,
        steps,
    })
}

fn record_ref(record: &CanonicalRecord) -> RecordRef {
    RecordRef {
        record_type: record.record_type,
        record_id: record.id.clone(),
    }
}

/// Sanitize an incoming field map against the type's allow-list. Total:
/// any input produces a safe map. Unknown keys are dropped silently;
/// numerics become digits or disappear; `furnished`/`client_type` fall
/// back to concrete defaults because a canonical record should not hold an
/// invalid-but-blank required enum.
pub fn sanitize_fields(
    record_type: RecordType,
    fields: &BTreeMap<String, JsonValue>,
) -> BTreeMap<String, FieldValue> {
    let mut out = BTreeMap::new();
    let mut allowed: Vec<&str> = record_type.allowed_fields().to_vec();
    for extra in record_type.list_fields() {
        if !allowed.contains(extra) {
            allowed.push(extra);
        }
    }

    for field in allowed {
        let Some(raw) = fields.get(field) else {
            continue;
        };

        if record_type.list_fields().contains(&field) {
            let values = coerce_list(raw);
            if !values.is_empty() {
                out.insert(field.to_string(), FieldValue::List(values));
            }
            continue;
        }

        let text = coerce_text(raw);
        let value = sanitize_text_field(record_type, field, &text);
        if let Some(value) = value {
            out.insert(field.to_string(), FieldValue::Text(value));
        }
    }
    out
}

fn sanitize_text_field(record_type: RecordType, field: &str, text: &str) -> Option<String> {
    let trimmed = text.trim();
    if record_type.numeric_fields().contains(&field) {
        let digits = crate::text::digits_only(trimmed);
        return if digits.is_empty() { None } else { Some(digits) };
    }
    if record_type.phone_fields().contains(&field) {
        let digits = crate::text::digits_only(trimmed);
        return if digits.is_empty() { None } else { Some(digits) };
    }
    if field == "furnished" {
        let lowered = trimmed.to_lowercase();
        return Some(
            if crate::pipeline::record::FURNISHED_VALUES.contains(&lowered.as_str()) {
                lowered
            } else {
                "unknown".to_string()
            },
        );
    }
    if field == "client_type" {
        let lowered = trimmed.to_lowercase();
        return Some(
            if crate::pipeline::record::CLIENT_TYPE_VALUES.contains(&lowered.as_str()) {
                lowered
            } else {
                "owner".to_string()
            },
        );
    }
    if field == "currency" {
        let candidate = crate::text::normalize_currency_word(trimmed);
        return match enum_values_for("currency") {
            Some(values) if values.contains(&candidate.as_str()) => Some(candidate),
            _ => None,
        };
    }
    if let Some(values) = enum_values_for(field) {
        let lowered = trimmed.to_lowercase();
        return if values.contains(&lowered.as_str()) {
            Some(lowered)
        } else {
            None
        };
    }
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn coerce_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Number(number) => number.to_string(),
        JsonValue::Bool(flag) => flag.to_string(),
        _ => String::new(),
    }
}

/// Comma-joined strings and JSON arrays both become clean string lists.
fn coerce_list(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        JsonValue::Array(items) => items
            .iter()
            .map(coerce_text)
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Merge sanitized fields into an existing record's fields. Returns the
/// names of fields whose canonical string form actually changed.
fn merge_fields(
    existing: &mut BTreeMap<String, FieldValue>,
    sanitized: &BTreeMap<String, FieldValue>,
    decisions: &BTreeMap<String, MergeDecision>,
) -> Vec<String> {
    let mut changed = Vec::new();
    for (field, incoming) in sanitized {
        let decision = decisions.get(field).copied().unwrap_or(if field == "notes" {
            MergeDecision::Append
        } else {
            MergeDecision::ReplaceWithNew
        });

        let before = existing.get(field).map(FieldValue::display);
        let merged = match decision {
            MergeDecision::KeepExisting => continue,
            MergeDecision::ReplaceWithNew => incoming.clone(),
            MergeDecision::Append => append_value(existing.get(field), incoming, field),
        };
        let after = merged.display();
        if before.as_deref() != Some(after.as_str()) {
            changed.push(field.clone());
        }
        existing.insert(field.clone(), merged);
    }
    changed
}

/// Append semantics are notes-only: newline-joined concatenation, falling
/// back to whichever side is non-empty. Other fields treat append as
/// replace.
fn append_value(existing: Option<&FieldValue>, incoming: &FieldValue, field: &str) -> FieldValue {
    if field != "notes" {
        return incoming.clone();
    }
    let old = existing.map(FieldValue::display).unwrap_or_default();
    let new = incoming.display();
    let old = old.trim();
    let new = new.trim();
    if old.is_empty() {
        FieldValue::text(new)
    } else if new.is_empty() || old == new {
        FieldValue::text(old)
    } else {
        FieldValue::text(format!("{old}\n{new}"))
    }
}

fn resolve_contact(
    ctx: &PipelineContext,
    record_type: RecordType,
    sanitized: &BTreeMap<String, FieldValue>,
) -> PipelineResult<Option<crate::services::store::Contact>> {
    let name_field = match record_type {
        RecordType::Client => "name",
        _ => "contact_name",
    };
    let phone_field = record_type.phone_fields().first().copied().unwrap_or("contact_phone");

    let name = sanitized
        .get(name_field)
        .and_then(|value| value.as_text())
        .unwrap_or("");
    let phone = sanitized.get(phone_field).and_then(|value| value.as_text());

    Ok(ctx.store.resolve_contact(name, phone)?)
}

/// Move every media row attached to the session over to the confirmed
/// record. Per-item failures never abort the batch: a failed move falls
/// back to a copy, and either way a warning is recorded.
async fn migrate_session_media(
    ctx: &PipelineContext,
    session_id: &str,
    record: &CanonicalRecord,
) -> PipelineResult<MediaMigration> {
    let mut migration = MediaMigration::default();

    for mut item in ctx.store.list_session_media(session_id)? {
        let filename = sanitize_filename(&item.original_filename);
        let target = record_media_path(record.record_type, &record.id, &filename);

        let relocated = match ctx.media.move_object(&item.storage_path, &target).await {
            Ok(()) => true,
            Err(move_err) => match ctx.media.copy_object(&item.storage_path, &target).await {
                Ok(()) => {
                    migration.warnings.push(format!(
                        "move failed for `{filename}` ({move_err}); copied instead"
                    ));
                    true
                }
                Err(copy_err) => {
                    migration.warnings.push(format!(
                        "move and copy both failed for `{filename}`: {move_err}; {copy_err}"
                    ));
                    false
                }
            },
        };

        if !relocated {
            continue;
        }

        item.owner = MediaOwner::Record {
            record_type: record.record_type,
            record_id: record.id.clone(),
        };
        item.storage_path = target.clone();
        item.file_url = ctx.media.public_url(&target);
        let media_type = item.media_type;
        ctx.store.put_media(item)?;

        migration.moved += 1;
        match media_type {
            MediaType::Image => migration.images += 1,
            MediaType::Video => migration.videos += 1,
            MediaType::Document => migration.documents += 1,
            MediaType::Other => {}
        }
    }

    Ok(migration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, JsonValue)]) -> BTreeMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn sanitizer_drops_unknown_keys_silently() {
        let input = fields(&[
            ("price", json!("5,500,000 EGP")),
            ("evil_extra", json!("x")),
        ]);
        let out = sanitize_fields(RecordType::Sale, &input);
        assert_eq!(out["price"], FieldValue::text("5500000"));
        assert!(!out.contains_key("evil_extra"));
    }

    #[test]
    fn sanitizer_coerces_lists_both_ways() {
        let input = fields(&[
            ("preferred_areas", json!("maadi, zamalek , ,")),
            ("tags", json!(["urgent", " cash "])),
        ]);
        let out = sanitize_fields(RecordType::Buyer, &input);
        assert_eq!(
            out["preferred_areas"],
            FieldValue::List(vec!["maadi".to_string(), "zamalek".to_string()])
        );
        assert_eq!(
            out["tags"],
            FieldValue::List(vec!["urgent".to_string(), "cash".to_string()])
        );
    }

    #[test]
    fn invalid_enums_fall_back_to_concrete_defaults() {
        let input = fields(&[("furnished", json!("very much so"))]);
        let out = sanitize_fields(RecordType::Sale, &input);
        assert_eq!(out["furnished"], FieldValue::text("unknown"));

        let input = fields(&[("client_type", json!("landlord-ish"))]);
        let out = sanitize_fields(RecordType::Client, &input);
        assert_eq!(out["client_type"], FieldValue::text("owner"));
    }

    #[test]
    fn numbers_and_phones_become_digits_or_vanish() {
        let input = fields(&[
            ("price", json!("call me")),
            ("contact_phone", json!("+20 100 123-4567")),
            ("bedrooms", json!(3)),
        ]);
        let out = sanitize_fields(RecordType::Sale, &input);
        assert!(!out.contains_key("price"), "non-numeric price must drop");
        assert_eq!(out["contact_phone"], FieldValue::text("201001234567"));
        assert_eq!(out["bedrooms"], FieldValue::text("3"));
    }

    #[test]
    fn merge_defaults_append_notes_replace_others() {
        let mut existing = BTreeMap::from([
            ("price".to_string(), FieldValue::text("5000000")),
            ("notes".to_string(), FieldValue::text("old note")),
        ]);
        let sanitized = BTreeMap::from([
            ("price".to_string(), FieldValue::text("5500000")),
            ("notes".to_string(), FieldValue::text("new note")),
        ]);
        let changed = merge_fields(&mut existing, &sanitized, &BTreeMap::new());
        assert_eq!(existing["price"], FieldValue::text("5500000"));
        assert_eq!(existing["notes"], FieldValue::text("old note\nnew note"));
        assert!(changed.contains(&"price".to_string()));
        assert!(changed.contains(&"notes".to_string()));
    }

    #[test]
    fn merge_respects_explicit_decisions() {
        let mut existing = BTreeMap::from([
            ("price".to_string(), FieldValue::text("5000000")),
            ("compound".to_string(), FieldValue::text("Palm Hills")),
        ]);
        let sanitized = BTreeMap::from([
            ("price".to_string(), FieldValue::text("9999999")),
            ("compound".to_string(), FieldValue::text("Palm Hills")),
        ]);
        let decisions =
            BTreeMap::from([("price".to_string(), MergeDecision::KeepExisting)]);
        let changed = merge_fields(&mut existing, &sanitized, &decisions);
        assert_eq!(existing["price"], FieldValue::text("5000000"));
        assert!(changed.is_empty(), "nothing actually changed: {changed:?}");
    }

    #[test]
    fn append_falls_back_to_non_empty_side() {
        let merged = append_value(None, &FieldValue::text("only new"), "notes");
        assert_eq!(merged, FieldValue::text("only new"));
        let merged = append_value(
            Some(&FieldValue::text("only old")),
            &FieldValue::text(""),
            "notes",
        );
        assert_eq!(merged, FieldValue::text("only old"));
    }
}
