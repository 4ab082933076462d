use super::{DatabaseError, Repository};
use crate::core::hash::{Digest, DigestSet, HashAlgorithm};
use crate::database::models::{ImageRecord, SimilarImage};
use crate::database::{FingerprintStore, initialize_schema};
use log::{debug, warn};
use rusqlite::{ErrorCode, OptionalExtension, params};
use std::path::{Path, PathBuf};

const SELECT_RECORD: &str = "SELECT id, storage_path, phash, ahash, dhash FROM images";

/// SQLite-backed fingerprint store over the `images` table.
pub struct ImageRepository {
    db_path: PathBuf,
}

impl Repository for ImageRepository {
    fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl ImageRepository {
    /// Open the store at `db_path`, creating the schema if needed.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self, DatabaseError> {
        let repo = Self {
            db_path: db_path.into(),
        };
        let conn = repo.get_connection()?;
        initialize_schema(&conn)?;
        Ok(repo)
    }

    pub fn find_by_path(&self, storage_path: &str) -> Result<Option<ImageRecord>, DatabaseError> {
        let conn = self.get_connection()?;

        conn.query_row(
            &format!("{SELECT_RECORD} WHERE storage_path = ?1"),
            params![storage_path],
            ImageRecord::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
    }

    pub fn count(&self) -> Result<i64, DatabaseError> {
        let conn = self.get_connection()?;

        conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))
            .map_err(DatabaseError::Query)
    }

    /// Administrative removal of a record. Returns whether a row was deleted.
    pub fn delete(&self, storage_path: &str) -> Result<bool, DatabaseError> {
        let conn = self.get_connection()?;

        let deleted_count = conn.execute(
            "DELETE FROM images WHERE storage_path = ?1",
            params![storage_path],
        )?;

        Ok(deleted_count > 0)
    }
}

impl FingerprintStore for ImageRepository {
    fn insert(
        &self,
        storage_path: &str,
        digests: &DigestSet,
    ) -> Result<ImageRecord, DatabaseError> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO images (storage_path, phash, ahash, dhash) VALUES (?1, ?2, ?3, ?4)",
            params![
                storage_path,
                digests.phash.as_ref().map(Digest::as_str),
                digests.ahash.as_ref().map(Digest::as_str),
                digests.dhash.as_ref().map(Digest::as_str),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                // Dropping `tx` rolls the statement back.
                return Err(DatabaseError::Conflict(storage_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let id = tx.last_insert_rowid();
        tx.commit()?;
        debug!("Recorded {} as image {}", storage_path, id);

        Ok(ImageRecord {
            id,
            storage_path: storage_path.to_string(),
            digests: digests.clone(),
        })
    }

    fn scan_all(&self) -> Result<Vec<ImageRecord>, DatabaseError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!("{SELECT_RECORD} ORDER BY id"))?;

        let records = stmt
            .query_map([], ImageRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn find_similar(
        &self,
        target: &Digest,
        algorithm: HashAlgorithm,
        threshold: u32,
    ) -> Result<Vec<SimilarImage>, DatabaseError> {
        // Column names come from the enum, never from caller input.
        let column = algorithm.as_str();
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT storage_path, {column} FROM images WHERE {column} IS NOT NULL ORDER BY id"
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (path, stored) = row?;
            match target.distance(&Digest::from_stored(stored)) {
                Ok(distance) if distance <= threshold => results.push(SimilarImage { path, distance }),
                Ok(_) => {}
                Err(e) => warn!("Skipping {} digest of {}: {}", algorithm, path, e),
            }
        }

        // Stable sort keeps insertion order among equal distances.
        results.sort_by_key(|similar| similar.distance);
        Ok(results)
    }

    fn contains(&self, storage_path: &str) -> Result<bool, DatabaseError> {
        Ok(self.find_by_path(storage_path)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::DigestError;
    use tempfile::{TempDir, tempdir};

    fn setup_test_db() -> (TempDir, ImageRepository) {
        let temp_dir = tempdir().unwrap();
        let repo = ImageRepository::new(temp_dir.path().join("test.db")).unwrap();
        (temp_dir, repo)
    }

    fn phash_only(hex: &str) -> DigestSet {
        DigestSet {
            phash: Some(Digest::from_hex(hex).unwrap()),
            ..DigestSet::default()
        }
    }

    #[test]
    fn test_insert_and_find_by_path() {
        let (_dir, repo) = setup_test_db();

        let digests = DigestSet {
            phash: Some(Digest::from_hex("f0f0f0f0f0f0f0f0").unwrap()),
            ahash: None,
            dhash: Some(Digest::from_hex("0000ffff0000ffff").unwrap()),
        };
        let record = repo.insert("images/a.png", &digests).unwrap();
        assert_eq!(record.storage_path, "images/a.png");

        let found = repo.find_by_path("images/a.png").unwrap().unwrap();
        assert_eq!(found, record);
        assert!(found.digests.ahash.is_none());
        assert!(repo.find_by_path("images/missing.png").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_path_conflicts() {
        let (_dir, repo) = setup_test_db();

        repo.insert("images/a.png", &phash_only("f0f0f0f0f0f0f0f0"))
            .unwrap();
        let second = repo.insert("images/a.png", &phash_only("0f0f0f0f0f0f0f0f"));

        assert!(matches!(second, Err(DatabaseError::Conflict(path)) if path == "images/a.png"));
        assert_eq!(repo.count().unwrap(), 1);
        let kept = repo.find_by_path("images/a.png").unwrap().unwrap();
        assert_eq!(kept.digests.phash.unwrap().as_str(), "f0f0f0f0f0f0f0f0");
    }

    #[test]
    fn test_scan_all_in_insertion_order() {
        let (_dir, repo) = setup_test_db();

        for name in ["c.png", "a.png", "b.png"] {
            repo.insert(name, &DigestSet::default()).unwrap();
        }

        let paths: Vec<String> = repo
            .scan_all()
            .unwrap()
            .into_iter()
            .map(|record| record.storage_path)
            .collect();
        assert_eq!(paths, ["c.png", "a.png", "b.png"]);
    }

    #[test]
    fn test_find_similar_ranks_and_filters() {
        let (_dir, repo) = setup_test_db();

        repo.insert("far.png", &phash_only("0f0f0f0f0f0f0f0f")).unwrap();
        repo.insert("three.png", &phash_only("f0f0f0f0f0f0f0f7")).unwrap();
        repo.insert("exact.png", &phash_only("f0f0f0f0f0f0f0f0")).unwrap();
        repo.insert("one.png", &phash_only("f0f0f0f0f0f0f0f1")).unwrap();
        repo.insert(
            "ahash-only.png",
            &DigestSet {
                ahash: Some(Digest::from_hex("f0f0f0f0f0f0f0f0").unwrap()),
                ..DigestSet::default()
            },
        )
        .unwrap();
        repo.insert("narrow.png", &phash_only("f0f0")).unwrap();

        let target = Digest::from_hex("f0f0f0f0f0f0f0f0").unwrap();
        let results = repo.find_similar(&target, HashAlgorithm::PHash, 5).unwrap();

        assert_eq!(
            results,
            vec![
                SimilarImage { path: "exact.png".into(), distance: 0 },
                SimilarImage { path: "one.png".into(), distance: 1 },
                SimilarImage { path: "three.png".into(), distance: 3 },
            ]
        );
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_find_similar_by_name_rejects_unknown_algorithm() {
        let (_dir, repo) = setup_test_db();
        let target = Digest::from_hex("f0f0f0f0f0f0f0f0").unwrap();

        let result = repo.find_similar_by_name(&target, "md5", 5);
        assert!(matches!(
            result,
            Err(DatabaseError::Digest(DigestError::InvalidAlgorithm(_)))
        ));
        assert!(repo.find_similar_by_name(&target, "dhash", 5).unwrap().is_empty());
    }

    #[test]
    fn test_contains_and_delete() {
        let (_dir, repo) = setup_test_db();
        repo.insert("images/a.png", &DigestSet::default()).unwrap();

        assert!(repo.contains("images/a.png").unwrap());
        assert!(repo.delete("images/a.png").unwrap());
        assert!(!repo.delete("images/a.png").unwrap());
        assert!(!repo.contains("images/a.png").unwrap());
    }

    #[test]
    fn test_records_persist_across_instances() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        ImageRepository::new(&db_path)
            .unwrap()
            .insert("images/a.png", &phash_only("f0f0f0f0f0f0f0f0"))
            .unwrap();

        let reopened = ImageRepository::new(&db_path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
