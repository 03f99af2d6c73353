use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

use crate::pipeline::record::RecordType;

// Object storage abstraction for attached media.
//
// Drafts live under `intake_sessions/{session_id}/{filename}`; confirmed
// records under `media/{record_type}/{record_id}/{filename}`. Confirmation
// moves objects between the two schemes.

/// Object path for media still attached to a draft session.
pub fn session_media_path(session_id: &str, filename: &str) -> String {
    debug_assert!(!session_id.contains('/'));
    format!("intake_sessions/{session_id}/{}", sanitize_filename(filename))
}

/// Object path for media attached to a confirmed record.
pub fn record_media_path(record_type: RecordType, record_id: &str, filename: &str) -> String {
    debug_assert!(!record_id.contains('/'));
    format!(
        "media/{}/{record_id}/{}",
        record_type.slug(),
        sanitize_filename(filename)
    )
}

/// Strip path separators and parent markers out of a client-supplied
/// filename before it lands in an object path.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|ch| if matches!(ch, '/' | '\\') { '_' } else { ch })
        .collect();
    let cleaned = cleaned.replace("..", "_");
    if cleaned.trim().is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.trim().to_string()
    }
}

/// Errors emitted by media object storage.
#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("io error at `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Object storage contract: upload by path, move, copy, public URL.
#[async_trait::async_trait]
pub trait MediaObjectStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), MediaStoreError>;

    /// Relocate an object. Fails if the source is missing; the caller may
    /// fall back to [`MediaObjectStore::copy_object`].
    async fn move_object(&self, from: &str, to: &str) -> Result<(), MediaStoreError>;

    /// Duplicate an object, leaving the source in place.
    async fn copy_object(&self, from: &str, to: &str) -> Result<(), MediaStoreError>;

    /// Public URL for an object path. Recomputed after relocation.
    fn public_url(&self, path: &str) -> String;
}

/// Filesystem-backed media store rooted under the app data directory.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
    base_url: String,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn object_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn ensure_parent(&self, target: &Path) -> Result<(), MediaStoreError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|source| MediaStoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MediaObjectStore for FsMediaStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), MediaStoreError> {
        let target = self.object_path(path);
        self.ensure_parent(&target).await?;
        fs::write(&target, bytes)
            .await
            .map_err(|source| MediaStoreError::Io {
                path: target.display().to_string(),
                source,
            })
    }

    async fn move_object(&self, from: &str, to: &str) -> Result<(), MediaStoreError> {
        let source = self.object_path(from);
        if !source.exists() {
            return Err(MediaStoreError::NotFound(from.to_string()));
        }
        let target = self.object_path(to);
        self.ensure_parent(&target).await?;
        fs::rename(&source, &target)
            .await
            .map_err(|err| MediaStoreError::Io {
                path: target.display().to_string(),
                source: err,
            })
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), MediaStoreError> {
        let source = self.object_path(from);
        if !source.exists() {
            return Err(MediaStoreError::NotFound(from.to_string()));
        }
        let target = self.object_path(to);
        self.ensure_parent(&target).await?;
        fs::copy(&source, &target)
            .await
            .map(|_| ())
            .map_err(|err| MediaStoreError::Io {
                path: target.display().to_string(),
                source: err,
            })
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}
