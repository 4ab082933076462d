//! Perceptual-hash deduplication in front of blob storage.
//!
//! An image is hashed, compared against every digest in the fingerprint
//! store and only uploaded when nothing similar is already recorded. See
//! [`ImageDeduplicator`] for the upload protocol.

pub mod config;
pub mod core;
pub mod database;
pub mod storage;

pub use crate::config::Config;
pub use crate::core::dedup::{DEFAULT_REMOTE_FOLDER, remote_key};
pub use crate::core::{
    Digest, DigestError, DigestSet, DuplicateCandidate, HashAlgorithm, HashSettings,
    ImageDeduplicator, ImageHasher, Originality, RejectReason, UploadError, UploadReceipt,
};
pub use crate::database::{DatabaseError, FingerprintStore, ImageRecord, ImageRepository};
pub use crate::storage::{BlobStore, StorageError, open_blob_store};
