use crate::core::hash::{Digest, DigestSet};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// A stored image: its storage path and the digests computed at upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub storage_path: String,
    #[serde(flatten)]
    pub digests: DigestSet,
}

impl ImageRecord {
    /// Map a row of `SELECT id, storage_path, phash, ahash, dhash`.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let digest = |idx: usize| -> rusqlite::Result<Option<Digest>> {
            Ok(row.get::<_, Option<String>>(idx)?.map(Digest::from_stored))
        };

        Ok(ImageRecord {
            id: row.get(0)?,
            storage_path: row.get(1)?,
            digests: DigestSet {
                phash: digest(2)?,
                ahash: digest(3)?,
                dhash: digest(4)?,
            },
        })
    }
}

/// One ranked result of a similarity search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarImage {
    pub path: String,
    pub distance: u32,
}
