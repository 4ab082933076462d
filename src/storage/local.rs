//! Local filesystem blob store.

use super::{BlobStore, StorageError, StorageOp, StorageResult, validate_key};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Stores blobs as plain files under a base directory.
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    /// Create the store, creating `base_dir` if it does not exist yet.
    pub fn new(base_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            StorageError::Config(format!(
                "cannot create storage directory {}: {e}",
                base_dir.display()
            ))
        })?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn key_path(&self, op: StorageOp, key: &str) -> StorageResult<PathBuf> {
        validate_key(op, key)?;
        Ok(self.base_dir.join(key))
    }
}

fn ensure_parent(op: StorageOp, key: &str, path: &Path) -> StorageResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| op.io_error(key, e))
        }
        _ => Ok(()),
    }
}

impl BlobStore for LocalBlobStore {
    fn upload(&self, local_path: &Path, key: &str) -> StorageResult<String> {
        let op = StorageOp::Upload;
        let dest = self.key_path(op, key)?;

        ensure_parent(op, key, &dest)
            .and_then(|_| fs::copy(local_path, &dest).map_err(|e| op.io_error(key, e)))
            .inspect_err(|e| warn!("Local storage upload failed: {e}"))?;

        debug!("Copied {} -> {}", local_path.display(), dest.display());
        Ok(dest.display().to_string())
    }

    fn download(&self, key: &str, local_path: &Path) -> StorageResult<()> {
        let op = StorageOp::Download;
        let src = self.key_path(op, key)?;

        ensure_parent(op, key, local_path)
            .and_then(|_| fs::copy(&src, local_path).map_err(|e| op.io_error(key, e)))
            .inspect_err(|e| warn!("Local storage download failed: {e}"))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        let op = StorageOp::Exists;
        let path = self.key_path(op, key)?;

        path.try_exists()
            .map(|found| found && path.is_file())
            .map_err(|e| op.io_error(key, e))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let op = StorageOp::Delete;
        let path = self.key_path(op, key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Delete of missing blob {key} is a no-op");
                Ok(())
            }
            Err(e) => {
                let err = op.io_error(key, e);
                warn!("Local storage delete failed: {err}");
                Err(err)
            }
        }
    }
}
