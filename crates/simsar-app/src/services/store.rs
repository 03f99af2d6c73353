//! LMDB persistence for sessions, canonical records, contacts, media rows,
//! code sequences and the append-only timeline.
//!
//! Write transactions are serialized by LMDB, which is what makes the code
//! counter's read-increment-commit and the contact phone index genuinely
//! atomic under concurrent confirmations.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::{Datelike, Utc};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::paths::{AppPaths, PathError};
use crate::pipeline::record::{DetectedType, FieldValue, RecordType};

const ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const CODE_PAD_WIDTH: usize = 5;

/// Lifecycle state of an intake session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Draft,
    NeedsReview,
    Confirmed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::NeedsReview => "needs_review",
            SessionStatus::Confirmed => "confirmed",
        }
    }
}

/// Status of a canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    Active,
    NeedsReview,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::NeedsReview => "needs_review",
        }
    }
}

/// Link from a confirmed session to the record it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub record_type: RecordType,
    pub record_id: String,
}

/// Processing metadata carried on a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub missing_critical: Vec<String>,
    #[serde(default)]
    pub field_confidence: BTreeMap<String, f32>,
    /// Raw model output preserved when extraction stayed unparseable.
    #[serde(default)]
    pub extraction_error: Option<String>,
    #[serde(default)]
    pub split_children: Vec<String>,
    #[serde(default)]
    pub confirmed_record: Option<RecordRef>,
}

/// A unit of raw intake text (plus attached media) awaiting classification
/// and confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeSession {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub raw_text: String,
    #[serde(default)]
    pub detected_type: Option<DetectedType>,
    #[serde(default)]
    pub confirmed_type: Option<RecordType>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: SessionMeta,
    #[serde(default)]
    pub completeness: f32,
    pub status: SessionStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl IntakeSession {
    #[must_use]
    pub fn new(raw_text: impl Into<String>) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            raw_text: raw_text.into(),
            detected_type: None,
            confirmed_type: None,
            fields: BTreeMap::new(),
            meta: SessionMeta::default(),
            completeness: 0.0,
            status: SessionStatus::Draft,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Child produced by splitting a multi-listing parent.
    #[must_use]
    pub fn child_of(parent_id: &str, raw_text: impl Into<String>) -> Self {
        let mut session = Self::new(raw_text);
        session.parent_id = Some(parent_id.to_string());
        session
    }

    pub fn touch(&mut self) {
        self.updated_at_ms = current_timestamp_ms();
    }
}

/// A confirmed Sale/Rent/Buyer/Client entity, the system's durable output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub record_type: RecordType,
    pub code: String,
    pub status: RecordStatus,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Where a media row is attached: a session before confirmation, a record
/// after. Never logically both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaOwner {
    Session {
        session_id: String,
    },
    Record {
        record_type: RecordType,
        record_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Image,
    Video,
    Document,
    Other,
}

impl MediaType {
    pub fn from_mime(mime: &str) -> Self {
        let lowered = mime.to_ascii_lowercase();
        if lowered.starts_with("image/") {
            MediaType::Image
        } else if lowered.starts_with("video/") {
            MediaType::Video
        } else if lowered.starts_with("application/pdf")
            || lowered.starts_with("application/msword")
            || lowered.starts_with("application/vnd")
            || lowered.starts_with("text/")
        {
            MediaType::Document
        } else {
            MediaType::Other
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub owner: MediaOwner,
    /// Storage-relative object path; the public URL is derived from it.
    pub storage_path: String,
    pub file_url: String,
    pub mime_type: String,
    pub media_type: MediaType,
    pub original_filename: String,
    pub size_bytes: u64,
    pub created_at_ms: i64,
}

/// Result of adding a media row; mirrors idempotent put semantics.
#[derive(Debug, Clone)]
pub struct MediaAdd {
    pub item: MediaItem,
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TimelineEventKind {
    Created,
    Updated {
        changed: Vec<String>,
    },
    MediaAttached {
        images: u32,
        videos: u32,
        documents: u32,
        has_warnings: bool,
    },
    MediaMoveWarning {
        warnings: Vec<String>,
    },
    SessionSplit {
        children: Vec<String>,
    },
}

/// Append-only audit entry attached to a record or session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    #[serde(default)]
    pub record: Option<RecordRef>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub kind: TimelineEventKind,
    pub created_at_ms: i64,
}

impl TimelineEvent {
    #[must_use]
    pub fn for_record(record: RecordRef, kind: TimelineEventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record: Some(record),
            session_id: None,
            kind,
            created_at_ms: current_timestamp_ms(),
        }
    }

    #[must_use]
    pub fn for_session(session_id: &str, kind: TimelineEventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record: None,
            session_id: Some(session_id.to_string()),
            kind,
            created_at_ms: current_timestamp_ms(),
        }
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// Errors emitted by the intake store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("record `{0}` not found")]
    RecordNotFound(String),
    #[error("session `{0}` is already confirmed")]
    AlreadyConfirmed(String),
}

/// LMDB-backed persistence for the intake pipeline.
#[derive(Debug)]
pub struct IntakeStore {
    env: Env,
    sessions: Database<Str, Bytes>,
    records: Database<Str, Bytes>,
    contacts: Database<Str, Bytes>,
    contact_phones: Database<Str, Str>,
    media: Database<Str, Bytes>,
    sequences: Database<Str, Bytes>,
    timeline: Database<Str, Bytes>,
}

impl IntakeStore {
    pub fn open(paths: &AppPaths) -> Result<Self, StoreError> {
        let path = paths.lmdb_env_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let sessions = env.create_database::<Str, Bytes>(&mut wtxn, Some("sessions"))?;
        let records = env.create_database::<Str, Bytes>(&mut wtxn, Some("records"))?;
        let contacts = env.create_database::<Str, Bytes>(&mut wtxn, Some("contacts"))?;
        let contact_phones = env.create_database::<Str, Str>(&mut wtxn, Some("contact_phones"))?;
        let media = env.create_database::<Str, Bytes>(&mut wtxn, Some("media"))?;
        let sequences = env.create_database::<Str, Bytes>(&mut wtxn, Some("sequences"))?;
        let timeline = env.create_database::<Str, Bytes>(&mut wtxn, Some("timeline"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            sessions,
            records,
            contacts,
            contact_phones,
            media,
            sequences,
            timeline,
        })
    }

    // --- sessions -------------------------------------------------------

    pub fn put_session(&self, session: &IntakeSession) -> Result<(), StoreError> {
        debug_assert!(!session.id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(session, config::standard())?;
        self.sessions
            .put(&mut wtxn, session.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<IntakeSession>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.sessions.get(&rtxn, id)? else {
            return Ok(None);
        };
        let (session, _) = decode_from_slice::<IntakeSession, _>(raw, config::standard())?;
        Ok(Some(session))
    }

    pub fn require_session(&self, id: &str) -> Result<IntakeSession, StoreError> {
        self.get_session(id)?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Sessions that still need a human, oldest first.
    pub fn list_sessions_by_status(
        &self,
        status: SessionStatus,
        limit: usize,
    ) -> Result<Vec<IntakeSession>, StoreError> {
        debug_assert!(limit > 0);
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.sessions.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (session, _) = decode_from_slice::<IntakeSession, _>(raw, config::standard())?;
            if session.status == status {
                out.push(session);
            }
        }
        out.sort_by_key(|session| session.created_at_ms);
        out.truncate(limit);
        Ok(out)
    }

    /// Existing children of a split parent; checked before creating new
    /// ones so re-running detection never duplicates children.
    pub fn children_of(&self, parent_id: &str) -> Result<Vec<IntakeSession>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.sessions.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (session, _) = decode_from_slice::<IntakeSession, _>(raw, config::standard())?;
            if session.parent_id.as_deref() == Some(parent_id) {
                out.push(session);
            }
        }
        out.sort_by_key(|session| session.created_at_ms);
        Ok(out)
    }

    /// Transition a session to confirmed. Enforced inside the write
    /// transaction: a session confirms at most once, a second call fails
    /// with [`StoreError::AlreadyConfirmed`] and writes nothing.
    pub fn confirm_session(
        &self,
        id: &str,
        record: RecordRef,
        missing_critical: Vec<String>,
    ) -> Result<IntakeSession, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let Some(raw) = self.sessions.get(&wtxn, id)? else {
            return Err(StoreError::SessionNotFound(id.to_string()));
        };
        let (mut session, _) = decode_from_slice::<IntakeSession, _>(raw, config::standard())?;
        if session.status == SessionStatus::Confirmed {
            return Err(StoreError::AlreadyConfirmed(id.to_string()));
        }
        session.status = SessionStatus::Confirmed;
        session.confirmed_type = Some(record.record_type);
        session.meta.confirmed_record = Some(record);
        session.meta.missing_critical = missing_critical;
        session.touch();
        let encoded = encode_to_vec(&session, config::standard())?;
        self.sessions.put(&mut wtxn, id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(session)
    }

    // --- records --------------------------------------------------------

    pub fn put_record(&self, record: &CanonicalRecord) -> Result<(), StoreError> {
        debug_assert!(!record.id.is_empty());
        debug_assert!(!record.code.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(record, config::standard())?;
        self.records
            .put(&mut wtxn, record.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_record(&self, id: &str) -> Result<Option<CanonicalRecord>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.records.get(&rtxn, id)? else {
            return Ok(None);
        };
        let (record, _) = decode_from_slice::<CanonicalRecord, _>(raw, config::standard())?;
        Ok(Some(record))
    }

    // --- contacts -------------------------------------------------------

    /// Resolve or lazily create a contact. Phone is the dedup key: lookup
    /// and create happen inside one write transaction, so at most one
    /// contact exists per non-empty phone. Name-only contacts are never
    /// deduplicated against each other.
    pub fn resolve_contact(
        &self,
        name: &str,
        phone: Option<&str>,
    ) -> Result<Option<Contact>, StoreError> {
        let name = name.trim();
        let phone = phone.map(str::trim).filter(|value| !value.is_empty());

        let mut wtxn = self.env.write_txn()?;
        if let Some(phone) = phone {
            if let Some(existing_id) = self.contact_phones.get(&wtxn, phone)? {
                let existing_id = existing_id.to_string();
                if let Some(raw) = self.contacts.get(&wtxn, existing_id.as_str())? {
                    let (contact, _) = decode_from_slice::<Contact, _>(raw, config::standard())?;
                    wtxn.commit()?;
                    return Ok(Some(contact));
                }
            }
            let contact = new_contact(name, Some(phone));
            let encoded = encode_to_vec(&contact, config::standard())?;
            self.contacts
                .put(&mut wtxn, contact.id.as_str(), encoded.as_slice())?;
            self.contact_phones
                .put(&mut wtxn, phone, contact.id.as_str())?;
            wtxn.commit()?;
            return Ok(Some(contact));
        }

        if name.is_empty() {
            return Ok(None);
        }
        let contact = new_contact(name, None);
        let encoded = encode_to_vec(&contact, config::standard())?;
        self.contacts
            .put(&mut wtxn, contact.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(Some(contact))
    }

    pub fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.contacts.get(&rtxn, id)? else {
            return Ok(None);
        };
        let (contact, _) = decode_from_slice::<Contact, _>(raw, config::standard())?;
        Ok(Some(contact))
    }

    // --- code sequences -------------------------------------------------

    /// Allocate the next `PREFIX-YEAR-00001`-style code for the current
    /// year. The read-increment-commit runs inside a single LMDB write
    /// transaction, so concurrent confirmations mint distinct, contiguous
    /// codes.
    pub fn allocate_code(&self, record_type: RecordType) -> Result<String, StoreError> {
        self.allocate_code_for_year(record_type, Utc::now().year())
    }

    pub fn allocate_code_for_year(
        &self,
        record_type: RecordType,
        year: i32,
    ) -> Result<String, StoreError> {
        let key = format!("{}-{year}", record_type.code_prefix());
        let mut wtxn = self.env.write_txn()?;
        let current = match self.sequences.get(&wtxn, key.as_str())? {
            Some(raw) => decode_from_slice::<u64, _>(raw, config::standard())?.0,
            None => 0,
        };
        let next = current + 1;
        let encoded = encode_to_vec(&next, config::standard())?;
        self.sequences
            .put(&mut wtxn, key.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(format!("{key}-{next:0width$}", width = CODE_PAD_WIDTH))
    }

    // --- media ----------------------------------------------------------

    /// Add a media row to a session. Duplicate suppression key within one
    /// session: (original filename, size). Re-adding an existing pair
    /// returns the stored row with `existed = true`.
    pub fn add_session_media(&self, item: MediaItem) -> Result<MediaAdd, StoreError> {
        let MediaOwner::Session { ref session_id } = item.owner else {
            debug_assert!(false, "add_session_media expects a session owner");
            return self.put_media(item.clone()).map(|_| MediaAdd {
                item,
                existed: false,
            });
        };
        let session_id = session_id.clone();

        let mut wtxn = self.env.write_txn()?;
        let mut duplicate: Option<MediaItem> = None;
        for entry in self.media.iter(&wtxn)? {
            let (_, raw) = entry?;
            let (existing, _) = decode_from_slice::<MediaItem, _>(raw, config::standard())?;
            let same_session = matches!(
                &existing.owner,
                MediaOwner::Session { session_id: sid } if *sid == session_id
            );
            if same_session
                && existing.original_filename == item.original_filename
                && existing.size_bytes == item.size_bytes
            {
                duplicate = Some(existing);
                break;
            }
        }
        if let Some(existing) = duplicate {
            wtxn.commit()?;
            return Ok(MediaAdd {
                item: existing,
                existed: true,
            });
        }
        let encoded = encode_to_vec(&item, config::standard())?;
        self.media
            .put(&mut wtxn, item.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(MediaAdd {
            item,
            existed: false,
        })
    }

    pub fn put_media(&self, item: MediaItem) -> Result<MediaItem, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(&item, config::standard())?;
        self.media
            .put(&mut wtxn, item.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(item)
    }

    pub fn list_session_media(&self, session_id: &str) -> Result<Vec<MediaItem>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.media.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (item, _) = decode_from_slice::<MediaItem, _>(raw, config::standard())?;
            if matches!(&item.owner, MediaOwner::Session { session_id: sid } if sid == session_id)
            {
                out.push(item);
            }
        }
        out.sort_by_key(|item| item.created_at_ms);
        Ok(out)
    }

    pub fn list_record_media(
        &self,
        record_type: RecordType,
        record_id: &str,
    ) -> Result<Vec<MediaItem>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.media.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (item, _) = decode_from_slice::<MediaItem, _>(raw, config::standard())?;
            let matches = matches!(
                &item.owner,
                MediaOwner::Record { record_type: rt, record_id: rid }
                    if *rt == record_type && rid == record_id
            );
            if matches {
                out.push(item);
            }
        }
        out.sort_by_key(|item| item.created_at_ms);
        Ok(out)
    }

    // --- timeline -------------------------------------------------------

    /// Append an event. The timeline is append-only; nothing in the core
    /// mutates or deletes entries.
    pub fn append_event(&self, event: TimelineEvent) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(&event, config::standard())?;
        self.timeline
            .put(&mut wtxn, event.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn events_for_record(
        &self,
        record_type: RecordType,
        record_id: &str,
    ) -> Result<Vec<TimelineEvent>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.timeline.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (event, _) = decode_from_slice::<TimelineEvent, _>(raw, config::standard())?;
            let matches = event
                .record
                .as_ref()
                .map(|r| r.record_type == record_type && r.record_id == record_id)
                .unwrap_or(false);
            if matches {
                out.push(event);
            }
        }
        out.sort_by_key(|event| event.created_at_ms);
        Ok(out)
    }

    pub fn events_for_session(&self, session_id: &str) -> Result<Vec<TimelineEvent>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.timeline.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (event, _) = decode_from_slice::<TimelineEvent, _>(raw, config::standard())?;
            if event.session_id.as_deref() == Some(session_id) {
                out.push(event);
            }
        }
        out.sort_by_key(|event| event.created_at_ms);
        Ok(out)
    }
}

fn new_contact(name: &str, phone: Option<&str>) -> Contact {
    let now_ms = current_timestamp_ms();
    Contact {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        phone: phone.map(str::to_string),
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
    }
}
