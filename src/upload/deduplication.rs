//! Deduplication Index
//!
//! Maps content fingerprints to stored records. The unique fingerprint column
//! in `file_records` is the single source of truth; the in-memory map is a
//! read-through cache of committed rows only.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use super::types::TransferError;
use crate::db::{FileRecord, FileRepository, InsertOutcome};
use crate::hasher::{FastKey, Fingerprint};

// ============================================================================
// Deduplication Index
// ============================================================================

#[derive(Clone)]
pub struct DeduplicationIndex {
    inner: Arc<DeduplicationIndexInner>,
}

struct DeduplicationIndexInner {
    db: SqlitePool,

    /// fingerprint -> committed record
    cache: RwLock<HashMap<Fingerprint, FileRecord>>,
}

impl DeduplicationIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            inner: Arc::new(DeduplicationIndexInner {
                db,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Stored record for this content, if any
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<FileRecord>, TransferError> {
        {
            let cache = self.inner.cache.read().await;
            if let Some(record) = cache.get(fingerprint) {
                tracing::debug!(fingerprint = %fingerprint, "Fingerprint found in cache");
                return Ok(Some(record.clone()));
            }
        }

        let found = FileRepository::new(&self.inner.db).get(fingerprint).await?;

        if let Some(ref record) = found {
            let mut cache = self.inner.cache.write().await;
            cache.insert(*fingerprint, record.clone());
        }

        Ok(found)
    }

    /// Atomically claim the fingerprint with `record`.
    ///
    /// Exactly one concurrent caller per fingerprint gets `Inserted`; the rest
    /// get `AlreadyExists` carrying the winner.
    pub async fn insert(&self, record: &FileRecord) -> Result<InsertOutcome, TransferError> {
        let outcome = FileRepository::new(&self.inner.db)
            .insert_if_absent(record)
            .await?;

        match &outcome {
            InsertOutcome::Inserted(stored) | InsertOutcome::AlreadyExists(stored) => {
                let mut cache = self.inner.cache.write().await;
                cache.insert(stored.fingerprint, stored.clone());
            }
            InsertOutcome::PathTaken => {}
        }

        if let InsertOutcome::AlreadyExists(existing) = &outcome {
            tracing::info!(
                fingerprint = %existing.fingerprint,
                storage_path = %existing.storage_path,
                "Index conflict resolved as duplicate"
            );
        }

        Ok(outcome)
    }

    /// Whether any stored record shares this fast key. A hit only means a
    /// full hash is worth computing first.
    pub async fn candidates_for_fast_key(&self, key: &FastKey) -> Result<bool, TransferError> {
        let matches = FileRepository::new(&self.inner.db)
            .find_by_fast_key(key)
            .await?;
        Ok(!matches.is_empty())
    }

    /// Undo a claim whose placement failed
    pub async fn release(&self, fingerprint: &Fingerprint) -> Result<(), TransferError> {
        {
            let mut cache = self.inner.cache.write().await;
            cache.remove(fingerprint);
        }
        let removed = FileRepository::new(&self.inner.db).delete(fingerprint).await?;

        tracing::warn!(
            fingerprint = %fingerprint,
            removed = removed,
            "Released index claim after failed placement"
        );
        Ok(())
    }

    // ========================================================================
    // Cache Management
    // ========================================================================

    pub async fn clear_cache(&self) {
        let mut cache = self.inner.cache.write().await;
        cache.clear();
        tracing::debug!("Cleared deduplication cache");
    }

    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.inner.cache.read().await;
        CacheStats {
            entries: cache.len(),
        }
    }

    /// Warm the cache with the most recently ingested records
    pub async fn preload_cache(&self, limit: usize) -> Result<usize, TransferError> {
        let records = FileRepository::new(&self.inner.db)
            .list_recent(limit as i64)
            .await?;

        let count = records.len();
        let mut cache = self.inner.cache.write().await;
        for record in records {
            cache.insert(record.fingerprint, record);
        }

        tracing::info!(count = count, "Preloaded deduplication cache");
        Ok(count)
    }
}

/// Statistics about the deduplication cache
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::hasher::fingerprint_bytes;
    use chrono::Utc;

    fn record(content: &[u8], path: &str, fast_key: Option<&str>) -> FileRecord {
        FileRecord {
            fingerprint: fingerprint_bytes(content),
            storage_path: path.to_string(),
            original_name: "IMG.JPG".to_string(),
            size: content.len() as u64,
            mime_type: "image/jpeg".to_string(),
            captured_at: None,
            ingested_at: Utc::now(),
            source_device: None,
            fast_key: fast_key.map(|k| FastKey::from(k.to_string())),
        }
    }

    #[tokio::test]
    async fn test_concurrent_inserts_have_one_winner() {
        let (pool, _dir) = test_pool().await;
        let index = DeduplicationIndex::new(pool);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let index = index.clone();
            tasks.push(tokio::spawn(async move {
                index
                    .insert(&record(b"same content", &format!("2024/01_January/{i}.jpg"), None))
                    .await
                    .unwrap()
            }));
        }

        let mut inserted = 0;
        let mut winners = std::collections::HashSet::new();
        for task in tasks {
            match task.await.unwrap() {
                InsertOutcome::Inserted(r) => {
                    inserted += 1;
                    winners.insert(r.storage_path);
                }
                InsertOutcome::AlreadyExists(r) => {
                    winners.insert(r.storage_path);
                }
                InsertOutcome::PathTaken => panic!("paths are distinct"),
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(winners.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_populates_cache() {
        let (pool, _dir) = test_pool().await;
        let index = DeduplicationIndex::new(pool.clone());
        let rec = record(b"abc", "a.jpg", None);
        FileRepository::new(&pool).insert_if_absent(&rec).await.unwrap();

        assert_eq!(index.cache_stats().await.entries, 0);
        assert!(index.lookup(&rec.fingerprint).await.unwrap().is_some());
        assert_eq!(index.cache_stats().await.entries, 1);
        assert!(index.lookup(&fingerprint_bytes(b"other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_removes_claim() {
        let (pool, _dir) = test_pool().await;
        let index = DeduplicationIndex::new(pool);
        let rec = record(b"abc", "a.jpg", Some("k1"));

        index.insert(&rec).await.unwrap();
        assert!(index
            .candidates_for_fast_key(&FastKey::from("k1".to_string()))
            .await
            .unwrap());

        index.release(&rec.fingerprint).await.unwrap();
        assert!(index.lookup(&rec.fingerprint).await.unwrap().is_none());
        assert!(!index
            .candidates_for_fast_key(&FastKey::from("k1".to_string()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_preload_cache() {
        let (pool, _dir) = test_pool().await;
        let repo = FileRepository::new(&pool);
        for i in 0..3u8 {
            repo.insert_if_absent(&record(&[i], &format!("{i}.jpg"), None))
                .await
                .unwrap();
        }

        let index = DeduplicationIndex::new(pool.clone());
        assert_eq!(index.preload_cache(2).await.unwrap(), 2);
        assert_eq!(index.cache_stats().await.entries, 2);

        index.clear_cache().await;
        assert_eq!(index.cache_stats().await.entries, 0);
    }
}
