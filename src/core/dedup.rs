// Duplicate detection in front of blob storage:
// - originality checks against every stored digest
// - upload with compensating rollback when the metadata write fails
// - pairwise duplicate scans over the fingerprint store

use crate::core::hash::{DigestError, HashAlgorithm, ImageHasher};
use crate::database::{DatabaseError, FingerprintStore, ImageRecord, SimilarImage};
use crate::storage::{BlobStore, StorageError};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const DEFAULT_REMOTE_FOLDER: &str = "images/";

/// Two stored images whose digests lie within the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub path_a: String,
    pub path_b: String,
    pub algorithm: HashAlgorithm,
    pub distance: u32,
}

#[derive(Debug, Error)]
pub enum RejectReason {
    #[error("near-duplicate of `{path}` ({algorithm} distance {distance})")]
    Duplicate {
        path: String,
        algorithm: HashAlgorithm,
        distance: u32,
    },

    #[error("originality cannot be verified: {0}")]
    Unverifiable(#[source] DigestError),

    #[error("storage path `{0}` is already recorded")]
    PathTaken(String),
}

/// Verdict of an originality check.
#[derive(Debug)]
pub enum Originality {
    Original,
    NotOriginal(RejectReason),
}

impl Originality {
    pub fn is_original(&self) -> bool {
        matches!(self, Originality::Original)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    /// Storage path recorded in the fingerprint store.
    pub path: String,
    /// Where the blob store says the bytes can be reached.
    pub location: String,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("image rejected: {0}")]
    Rejected(RejectReason),

    #[error("fingerprint lookup failed: {0}")]
    Lookup(#[source] DatabaseError),

    #[error("image path has no file name: {0}")]
    InvalidPath(PathBuf),

    #[error("upload failed: {0}")]
    UploadFailed(#[source] StorageError),

    /// The blob was written but its record was not. `orphaned` holds the
    /// error of the compensating delete if that failed too, in which case
    /// the blob under `key` has no metadata.
    #[error("metadata write for `{key}` failed: {source}")]
    MetadataFailed {
        key: String,
        #[source]
        source: DatabaseError,
        orphaned: Option<StorageError>,
    },
}

impl UploadError {
    /// Key of a blob left without metadata, if any.
    pub fn orphaned_key(&self) -> Option<&str> {
        match self {
            UploadError::MetadataFailed {
                key,
                orphaned: Some(_),
                ..
            } => Some(key),
            _ => None,
        }
    }
}

/// Ties digests, the fingerprint store and the blob store together.
///
/// Uploads are serialized through an internal lock so that the
/// originality-check-then-insert sequence cannot interleave between callers
/// sharing one deduplicator. Separate processes sharing a database are only
/// protected by the store's unique storage path.
pub struct ImageDeduplicator {
    storage: Box<dyn BlobStore>,
    db: Box<dyn FingerprintStore>,
    hasher: ImageHasher,
    threshold: u32,
    write_lock: Mutex<()>,
}

impl ImageDeduplicator {
    pub fn new(
        storage: Box<dyn BlobStore>,
        db: Box<dyn FingerprintStore>,
        hasher: ImageHasher,
    ) -> Self {
        Self {
            storage,
            db,
            hasher,
            threshold: crate::config::DEFAULT_SIMILARITY_THRESHOLD,
            write_lock: Mutex::new(()),
        }
    }

    /// Threshold `upload_image` uses for its originality check.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn hasher(&self) -> &ImageHasher {
        &self.hasher
    }

    pub fn storage(&self) -> &dyn BlobStore {
        self.storage.as_ref()
    }

    pub fn fingerprints(&self) -> &dyn FingerprintStore {
        self.db.as_ref()
    }

    /// Whether no stored digest, of any variant, lies within `threshold` of
    /// the image's primary digest. An image whose digest cannot be computed
    /// is not original.
    pub fn is_original(&self, image: &Path, threshold: u32) -> Result<bool, DatabaseError> {
        Ok(self.check_originality(image, threshold)?.is_original())
    }

    pub fn check_originality(
        &self,
        image: &Path,
        threshold: u32,
    ) -> Result<Originality, DatabaseError> {
        let digest = match self.hasher.compute(image) {
            Ok(digest) => digest,
            Err(e) => return Ok(Originality::NotOriginal(RejectReason::Unverifiable(e))),
        };
        debug!("{}: {} digest {}", image.display(), self.hasher.algorithm(), digest);

        for record in self.db.scan_all()? {
            for (algorithm, stored) in record.digests.iter() {
                match digest.distance(stored) {
                    Ok(distance) if distance <= threshold => {
                        return Ok(Originality::NotOriginal(RejectReason::Duplicate {
                            path: record.storage_path.clone(),
                            algorithm,
                            distance,
                        }));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(
                        "Skipping {} digest of {}: {}",
                        algorithm, record.storage_path, e
                    ),
                }
            }
        }

        Ok(Originality::Original)
    }

    /// Upload `image` under `remote_folder` unless it duplicates a stored
    /// image, then record its digests. If recording fails the blob is deleted
    /// again, once, without retry.
    pub fn upload_image(
        &self,
        image: &Path,
        remote_folder: &str,
    ) -> Result<UploadReceipt, UploadError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Originality::NotOriginal(reason) = self
            .check_originality(image, self.threshold)
            .map_err(UploadError::Lookup)?
        {
            info!("Rejected {}: {}", image.display(), reason);
            return Err(UploadError::Rejected(reason));
        }

        let key = remote_key(remote_folder, image)
            .ok_or_else(|| UploadError::InvalidPath(image.to_path_buf()))?;

        // A failed insert would roll back by deleting `key`, which must never
        // hit a blob that belongs to an existing record.
        if self.db.contains(&key).map_err(UploadError::Lookup)? {
            info!("Rejected {}: {} already recorded", image.display(), key);
            return Err(UploadError::Rejected(RejectReason::PathTaken(key)));
        }

        let location = self
            .storage
            .upload(image, &key)
            .map_err(UploadError::UploadFailed)?;
        debug!("{}: uploaded to {}", key, location);

        let digests = self.hasher.compute_all(image);
        match self.db.insert(&key, &digests) {
            Ok(record) => {
                info!("Stored {} as {}", image.display(), record.storage_path);
                Ok(UploadReceipt {
                    path: record.storage_path,
                    location,
                })
            }
            Err(source) => {
                warn!("Metadata write for {} failed, rolling back upload: {}", key, source);
                let orphaned = match self.storage.delete(&key) {
                    Ok(()) => {
                        debug!("{}: rolled back", key);
                        None
                    }
                    Err(e) => {
                        error!("Rollback of {} failed, blob is orphaned: {}", key, e);
                        Some(e)
                    }
                };
                Err(UploadError::MetadataFailed {
                    key,
                    source,
                    orphaned,
                })
            }
        }
    }

    /// Every stored pair within `threshold`, reporting at most one variant per
    /// pair (the first of phash, ahash, dhash that matches).
    pub fn find_duplicates(&self, threshold: u32) -> Result<Vec<DuplicateCandidate>, DatabaseError> {
        let records = self.db.scan_all()?;
        let mut duplicates = Vec::new();

        for (i, a) in records.iter().enumerate() {
            for b in &records[i + 1..] {
                if let Some((algorithm, distance)) = first_match(a, b, threshold) {
                    duplicates.push(DuplicateCandidate {
                        path_a: a.storage_path.clone(),
                        path_b: b.storage_path.clone(),
                        algorithm,
                        distance,
                    });
                }
            }
        }

        Ok(duplicates)
    }

    /// Stored images similar to `image` under the primary variant, nearest
    /// first. Empty if the image cannot be hashed.
    pub fn check_store_duplicate(
        &self,
        image: &Path,
        threshold: u32,
    ) -> Result<Vec<SimilarImage>, DatabaseError> {
        match self.hasher.compute(image) {
            Ok(digest) => self
                .db
                .find_similar(&digest, self.hasher.algorithm(), threshold),
            Err(_) => Ok(Vec::new()),
        }
    }
}

fn first_match(a: &ImageRecord, b: &ImageRecord, threshold: u32) -> Option<(HashAlgorithm, u32)> {
    HashAlgorithm::ALL.into_iter().find_map(|algorithm| {
        let (left, right) = (a.digests.get(algorithm)?, b.digests.get(algorithm)?);
        match left.distance(right) {
            Ok(distance) if distance <= threshold => Some((algorithm, distance)),
            _ => None,
        }
    })
}

/// `folder/` joined with the image's file name.
pub fn remote_key(remote_folder: &str, image: &Path) -> Option<String> {
    let file_name = image.file_name()?.to_str()?;
    let folder = remote_folder.trim_matches('/');
    if folder.is_empty() {
        Some(file_name.to_string())
    } else {
        Some(format!("{folder}/{file_name}"))
    }
}
