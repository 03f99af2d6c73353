use std::{num::NonZeroU32, sync::Arc, time::Duration};

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use thiserror::Error;

use crate::config::AppConfig;
use crate::paths::{AppPaths, PathError};
use crate::services::classifier::ClassifyError;
use crate::services::extractor::ExtractError;
use crate::services::media::{FsMediaStore, MediaObjectStore, MediaStoreError};
use crate::services::model::{CompletionClient, GeminiCompletionClient, ModelError};
use crate::services::segmenter::SegmentError;
use crate::services::store::{IntakeStore, StoreError};

/// Model-invoking operations allowed per actor per window.
pub const MODEL_CALLS_PER_WINDOW: u32 = 20;
/// Sliding window for the per-actor model budget.
pub const MODEL_WINDOW: Duration = Duration::from_secs(60);

pub type ActorRateLimiter = DefaultKeyedRateLimiter<String>;

/// Injectable rate limiters. Process-local; a multi-instance deployment
/// swaps these for a shared-store implementation.
#[derive(Default)]
pub struct Governors {
    pub model: Option<Arc<ActorRateLimiter>>,
}

impl Governors {
    pub fn with_model_limiter() -> Self {
        Self {
            model: Some(default_model_limiter()),
        }
    }
}

/// Keyed limiter for model-invoking operations: 20 calls / 60 s per actor.
pub fn default_model_limiter() -> Arc<ActorRateLimiter> {
    let replenish = MODEL_WINDOW / MODEL_CALLS_PER_WINDOW;
    let quota = Quota::with_period(replenish)
        .expect("model window must be non-zero")
        .allow_burst(NonZeroU32::new(MODEL_CALLS_PER_WINDOW).expect("burst must be non-zero"));
    Arc::new(DefaultKeyedRateLimiter::keyed(quota))
}

/// Explicitly constructed service bundle threaded through the pipeline.
pub struct PipelineContext {
    pub store: Arc<IntakeStore>,
    pub media: Arc<dyn MediaObjectStore>,
    pub model: Arc<dyn CompletionClient>,
    pub governors: Governors,
}

impl PipelineContext {
    /// Charge one model-invoking call against the actor's budget. Exceeding
    /// it fails immediately; callers are expected to retry later.
    pub fn check_model_budget(&self, actor: &str) -> PipelineResult<()> {
        let Some(limiter) = self.governors.model.as_ref() else {
            return Ok(());
        };
        match limiter.check_key(&actor.to_string()) {
            Ok(()) => Ok(()),
            Err(negative) => {
                let now = DefaultClock::default().now();
                let retry_after_ms = negative.wait_time_from(now).as_millis() as u64;
                Err(PipelineError::RateLimited { retry_after_ms })
            }
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("{record_type} record `{record_id}` not found")]
    RecordNotFound {
        record_type: String,
        record_id: String,
    },
    #[error("session `{0}` is already confirmed")]
    AlreadyConfirmed(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("classification output stayed malformed after one repair attempt")]
    ClassificationParse { raw: String },
    #[error("extraction output stayed malformed after one repair attempt")]
    ExtractionParse { raw: String },
    #[error("model call budget exceeded; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Media(#[from] MediaStoreError),
    #[error("storage error: {0}")]
    Store(StoreError),
}

impl PipelineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PipelineError::InvalidRequest(msg.into())
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::SessionNotFound(id) => PipelineError::SessionNotFound(id),
            StoreError::AlreadyConfirmed(id) => PipelineError::AlreadyConfirmed(id),
            other => PipelineError::Store(other),
        }
    }
}

impl From<ClassifyError> for PipelineError {
    fn from(error: ClassifyError) -> Self {
        match error {
            ClassifyError::Model(model) => PipelineError::Model(model),
            ClassifyError::Parse { raw } => PipelineError::ClassificationParse { raw },
        }
    }
}

impl From<ExtractError> for PipelineError {
    fn from(error: ExtractError) -> Self {
        match error {
            ExtractError::Model(model) => PipelineError::Model(model),
            ExtractError::Parse { raw } => PipelineError::ExtractionParse { raw },
        }
    }
}

impl From<SegmentError> for PipelineError {
    fn from(error: SegmentError) -> Self {
        match error {
            SegmentError::Model(model) => PipelineError::Model(model),
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextBuildError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Wire the production context: LMDB store, filesystem media store, Gemini
/// completion client and the per-actor model governor.
pub fn build_pipeline_context(config: &AppConfig) -> Result<PipelineContext, ContextBuildError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let store = Arc::new(IntakeStore::open(&paths)?);
    let media_root = paths.media_root()?;
    let media: Arc<dyn MediaObjectStore> =
        Arc::new(FsMediaStore::new(media_root, config.storage.public_base_url.clone()));
    let model: Arc<dyn CompletionClient> =
        Arc::new(GeminiCompletionClient::from_env(config.model.name.clone())?);

    Ok(PipelineContext {
        store,
        media,
        model,
        governors: Governors::with_model_limiter(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::media::FsMediaStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopClient;

    #[async_trait]
    impl CompletionClient for NoopClient {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, ModelError> {
            Ok("{}".to_string())
        }
    }

    fn context_with_limiter(limiter: Option<Arc<ActorRateLimiter>>) -> (PipelineContext, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(dir.path()).expect("paths");
        let store = Arc::new(IntakeStore::open(&paths).expect("store"));
        let media_root = paths.media_root().expect("media root");
        let ctx = PipelineContext {
            store,
            media: Arc::new(FsMediaStore::new(media_root, "http://localhost/files")),
            model: Arc::new(NoopClient),
            governors: Governors { model: limiter },
        };
        (ctx, dir)
    }

    #[test]
    fn budget_exhausts_per_actor_not_globally() {
        let (ctx, _dir) = context_with_limiter(Some(default_model_limiter()));
        for _ in 0..MODEL_CALLS_PER_WINDOW {
            ctx.check_model_budget("agent-a").expect("within budget");
        }
        let error = ctx
            .check_model_budget("agent-a")
            .expect_err("burst spent, call must be rejected");
        assert!(matches!(error, PipelineError::RateLimited { .. }));

        ctx.check_model_budget("agent-b")
            .expect("other actors keep their own budget");
    }

    #[test]
    fn missing_limiter_means_no_budget() {
        let (ctx, _dir) = context_with_limiter(None);
        for _ in 0..100 {
            ctx.check_model_budget("anyone").expect("unlimited");
        }
    }

    #[test]
    fn store_errors_map_to_named_pipeline_errors() {
        let mapped: PipelineError = StoreError::SessionNotFound("s1".to_string()).into();
        assert!(matches!(mapped, PipelineError::SessionNotFound(_)));
        let mapped: PipelineError = StoreError::AlreadyConfirmed("s1".to_string()).into();
        assert!(matches!(mapped, PipelineError::AlreadyConfirmed(_)));
    }
}
