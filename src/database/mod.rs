pub mod models;
pub mod repositories;

pub use models::{ImageRecord, SimilarImage};
pub use repositories::{ImageRepository, Repository};

use crate::core::hash::{Digest, DigestError, DigestSet, HashAlgorithm};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Storage path already recorded: {0}")]
    Conflict(String),

    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error(transparent)]
    Digest(#[from] DigestError),
}

/// Durable index of image records and their digests.
pub trait FingerprintStore: Send + Sync {
    /// Record `storage_path` with its digests. Fails with
    /// [`DatabaseError::Conflict`] if the path is already recorded, leaving the
    /// store unchanged.
    fn insert(&self, storage_path: &str, digests: &DigestSet)
    -> Result<ImageRecord, DatabaseError>;

    /// Every record, in insertion order.
    fn scan_all(&self) -> Result<Vec<ImageRecord>, DatabaseError>;

    /// Records whose `algorithm` digest lies within `threshold` of `target`,
    /// nearest first.
    fn find_similar(
        &self,
        target: &Digest,
        algorithm: HashAlgorithm,
        threshold: u32,
    ) -> Result<Vec<SimilarImage>, DatabaseError>;

    fn contains(&self, storage_path: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .scan_all()?
            .iter()
            .any(|record| record.storage_path == storage_path))
    }

    /// [`FingerprintStore::find_similar`] keyed by variant name, failing with
    /// [`DigestError::InvalidAlgorithm`] for anything but phash, ahash or dhash.
    fn find_similar_by_name(
        &self,
        target: &Digest,
        algorithm: &str,
        threshold: u32,
    ) -> Result<Vec<SimilarImage>, DatabaseError> {
        let algorithm: HashAlgorithm = algorithm.parse()?;
        self.find_similar(target, algorithm, threshold)
    }
}

pub fn establish_connection(db_path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

pub fn initialize_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            storage_path TEXT UNIQUE NOT NULL,
            phash TEXT,
            ahash TEXT,
            dhash TEXT
        )",
        [],
    )?;
    Ok(())
}
