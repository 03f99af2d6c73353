//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules exposed here coordinate external systems (the completion
//! service, storage, rate limiting) and must avoid embedding pure
//! transforms. Keep stateless helpers in `crate::text` or
//! `crate::pipeline` so concurrency and resource accounting stay
//! localized.

pub mod classifier;
pub mod confirm;
pub mod context;
pub mod extractor;
pub mod media;
pub mod model;
pub mod processor;
pub mod segmenter;
pub mod store;

pub use classifier::{Classifier, ClassifyError};
pub use confirm::{
    confirm, sanitize_fields, ConfirmCommand, ConfirmMode, ConfirmOutcome, ConfirmStep,
    MediaMigration, MergeDecision,
};
pub use context::{
    build_pipeline_context, default_model_limiter, ActorRateLimiter, ContextBuildError,
    Governors, PipelineContext, PipelineError, PipelineResult, MODEL_CALLS_PER_WINDOW,
    MODEL_WINDOW,
};
pub use extractor::{ExtractError, Extractor};
pub use media::{
    record_media_path, sanitize_filename, session_media_path, FsMediaStore, MediaObjectStore,
    MediaStoreError,
};
pub use model::{
    complete_json, extract_json_object, CompleteJsonError, CompletionClient,
    GeminiCompletionClient, ModelError,
};
pub use processor::{detect_and_extract, force_extract, ExtractionReport};
pub use segmenter::{SegmentError, Segmenter};
pub use store::{
    CanonicalRecord, Contact, IntakeSession, IntakeStore, MediaAdd, MediaItem, MediaOwner,
    MediaType, RecordRef, RecordStatus, SessionMeta, SessionStatus, StoreError, TimelineEvent,
    TimelineEventKind,
};
