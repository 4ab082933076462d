//! Blob storage for uploaded image bytes.
//!
//! [`BlobStore`] is the capability set the deduplicator depends on. Two
//! backends implement it: [`LocalBlobStore`] copies into a base directory and
//! [`OssBlobStore`] talks to an OSS-compatible object storage service.
//!
//! Backend faults never escape as raw errors. Each one is logged and returned
//! as a [`StorageError`] naming the failed operation, the key, a
//! [`StorageErrorKind`] and the underlying cause.

pub mod local;
pub mod oss;

pub use local::LocalBlobStore;
pub use oss::OssBlobStore;

use crate::config::StorageSettings;
use std::fmt;
use std::path::{Component, Path};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Coarse classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    NotFound,
    PermissionDenied,
    Network,
    Io,
    InvalidKey,
    Backend,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageErrorKind::NotFound => "object not found",
            StorageErrorKind::PermissionDenied => "permission denied",
            StorageErrorKind::Network => "network error",
            StorageErrorKind::Io => "I/O error",
            StorageErrorKind::InvalidKey => "invalid key",
            StorageErrorKind::Backend => "backend error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload of `{key}` failed: {kind}")]
    UploadFailed {
        key: String,
        kind: StorageErrorKind,
        #[source]
        source: Option<BoxError>,
    },

    #[error("download of `{key}` failed: {kind}")]
    DownloadFailed {
        key: String,
        kind: StorageErrorKind,
        #[source]
        source: Option<BoxError>,
    },

    #[error("existence check of `{key}` failed: {kind}")]
    ExistsFailed {
        key: String,
        kind: StorageErrorKind,
        #[source]
        source: Option<BoxError>,
    },

    #[error("delete of `{key}` failed: {kind}")]
    DeleteFailed {
        key: String,
        kind: StorageErrorKind,
        #[source]
        source: Option<BoxError>,
    },

    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn kind(&self) -> Option<StorageErrorKind> {
        match self {
            StorageError::UploadFailed { kind, .. }
            | StorageError::DownloadFailed { kind, .. }
            | StorageError::ExistsFailed { kind, .. }
            | StorageError::DeleteFailed { kind, .. } => Some(*kind),
            StorageError::Config(_) => None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            StorageError::UploadFailed { key, .. }
            | StorageError::DownloadFailed { key, .. }
            | StorageError::ExistsFailed { key, .. }
            | StorageError::DeleteFailed { key, .. } => Some(key),
            StorageError::Config(_) => None,
        }
    }
}

/// The blob-store operation a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Upload,
    Download,
    Exists,
    Delete,
}

impl StorageOp {
    pub fn error(
        self,
        key: &str,
        kind: StorageErrorKind,
        source: Option<BoxError>,
    ) -> StorageError {
        let key = key.to_string();
        match self {
            StorageOp::Upload => StorageError::UploadFailed { key, kind, source },
            StorageOp::Download => StorageError::DownloadFailed { key, kind, source },
            StorageOp::Exists => StorageError::ExistsFailed { key, kind, source },
            StorageOp::Delete => StorageError::DeleteFailed { key, kind, source },
        }
    }

    pub fn io_error(self, key: &str, err: std::io::Error) -> StorageError {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        self.error(key, kind, Some(Box::new(err)))
    }
}

/// Capability set every blob backend provides.
pub trait BlobStore: Send + Sync {
    /// Store the file at `local_path` under `key`, returning where it can be
    /// reached (a URL for networked backends, a file path for local ones).
    fn upload(&self, local_path: &Path, key: &str) -> StorageResult<String>;

    fn download(&self, key: &str, local_path: &Path) -> StorageResult<()>;

    fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Remove `key`. Deleting a key that does not exist succeeds.
    fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Build the backend selected by the configuration.
pub fn open_blob_store(settings: &StorageSettings) -> StorageResult<Box<dyn BlobStore>> {
    match settings {
        StorageSettings::Local { base_path } => Ok(Box::new(LocalBlobStore::new(base_path)?)),
        StorageSettings::Oss(oss) => Ok(Box::new(OssBlobStore::new(oss)?)),
    }
}

/// Reject keys that are empty, absolute, or contain anything but normal path
/// components.
pub fn validate_key(op: StorageOp, key: &str) -> StorageResult<()> {
    let invalid = |reason: &str| {
        op.error(
            key,
            StorageErrorKind::InvalidKey,
            Some(format!("{reason}: {key}").into()),
        )
    };

    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.starts_with('/') || key.starts_with('\\') || key.contains("..") {
        return Err(invalid("path traversal not allowed"));
    }
    if !Path::new(key)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(invalid("contains unsafe path component"));
    }
    Ok(())
}
