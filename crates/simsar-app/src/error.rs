//! Application-level error type shared across binaries and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::services::{ContextBuildError, MediaStoreError, PipelineError, StoreError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Context(#[from] ContextBuildError),
    #[error(transparent)]
    Server(#[from] simsar_server::ServerError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Media(#[from] MediaStoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown record type `{0}` (expected sale, rent, buyer or client)")]
    UnknownRecordType(String),
    #[error("session text may not be empty")]
    EmptySessionText,
}
