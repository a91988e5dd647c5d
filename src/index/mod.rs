//! The durable cache index (spec §4.1): a single-writer key-value store
//! with three logical buckets, `files`, `uploads`, `stats`.
//!
//! Grounded on the teacher's choice of an embedded store (SlateDB there,
//! for a distributed LSM tree) generalized to `sled`, the pack's embedded
//! B-tree store with per-tree namespaces and fsync-on-flush durability —
//! the closest idiomatic match to spec §4.1's "minimal implementation is a
//! single embedded B-tree-style store with file locking."

mod migration;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use sled::transaction::Transactional;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};
use crate::model::{FileMeta, Stats, UploadRecord, UploadStatus};
use crate::task::spawn_blocking_named;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const STATS_KEY: &[u8] = b"stats";

/// A mutation applied to a `FileMeta` inside `CacheIndex::update`. Boxed
/// rather than generic so `CacheIndex` stays object-safe (spec §9:
/// "Dynamic dispatch... CacheIndex, for swapping the embedded store").
pub type MetaMutation = Box<dyn FnOnce(&mut FileMeta) + Send>;

#[async_trait]
pub trait CacheIndex: Send + Sync {
    async fn put(&self, meta: FileMeta, cancel: &CancellationToken) -> CacheResult<()>;
    async fn get(&self, path: &str, cancel: &CancellationToken) -> CacheResult<FileMeta>;
    async fn update(
        &self,
        path: &str,
        f: MetaMutation,
        cancel: &CancellationToken,
    ) -> CacheResult<FileMeta>;
    async fn delete(&self, path: &str, cancel: &CancellationToken) -> CacheResult<()>;
    async fn list_lru(&self, limit: usize, cancel: &CancellationToken) -> CacheResult<Vec<FileMeta>>;
    async fn add_upload(
        &self,
        record: UploadRecord,
        cancel: &CancellationToken,
    ) -> CacheResult<UploadRecord>;
    async fn list_uploads(&self, cancel: &CancellationToken) -> CacheResult<Vec<UploadRecord>>;
    async fn update_upload_status(
        &self,
        id: u64,
        status: UploadStatus,
        last_error: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<UploadRecord>;
    async fn stats(&self, cancel: &CancellationToken) -> CacheResult<Stats>;
    /// Flush and close the underlying store. Idempotent.
    async fn close(&self) -> CacheResult<()>;
}

fn check_cancelled(cancel: &CancellationToken) -> CacheResult<()> {
    if cancel.is_cancelled() {
        Err(CacheError::Cancelled)
    } else {
        Ok(())
    }
}

/// `sled`-backed implementation. All mutating operations call
/// `Tree::flush`/`Db::flush` before returning, so a successful return is
/// fsync-durable (spec §4.1, "Durability").
pub struct SledCacheIndex {
    db: sled::Db,
    files: sled::Tree,
    uploads: sled::Tree,
    stats: sled::Tree,
    upload_seq: AtomicU64,
}

impl SledCacheIndex {
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
        let files = Self::open_tree(&db, "files")?;
        let uploads = Self::open_tree(&db, "uploads")?;
        let stats_tree = Self::open_tree(&db, "stats")?;

        let found_version = migration::read_schema_version(&stats_tree)?;
        let stats = match found_version {
            None => {
                let stats = Stats::default();
                migration::write_stats(&stats_tree, &stats)?;
                stats
            }
            Some(v) if v == CURRENT_SCHEMA_VERSION => migration::read_stats(&stats_tree)?
                .unwrap_or_default(),
            Some(v) if v < CURRENT_SCHEMA_VERSION => {
                migration::run_migrations(&stats_tree, v, CURRENT_SCHEMA_VERSION)?
            }
            Some(v) => {
                return Err(CacheError::UnknownSchema {
                    found: v,
                    expected: CURRENT_SCHEMA_VERSION,
                });
            }
        };

        Ok(Self {
            db,
            files,
            uploads,
            stats: stats_tree,
            upload_seq: AtomicU64::new(stats.upload_seq),
        })
    }

    fn open_tree(db: &sled::Db, name: &str) -> CacheResult<sled::Tree> {
        db.open_tree(name).map_err(|e| CacheError::Io(std::io::Error::other(e)))
    }

    fn decode_meta(bytes: &[u8]) -> CacheResult<FileMeta> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Io(std::io::Error::other(e)))
    }

    fn encode_meta(meta: &FileMeta) -> CacheResult<Vec<u8>> {
        bincode::serialize(meta).map_err(|e| CacheError::Io(std::io::Error::other(e)))
    }

    fn decode_record(bytes: &[u8]) -> CacheResult<UploadRecord> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Io(std::io::Error::other(e)))
    }

    fn encode_record(record: &UploadRecord) -> CacheResult<Vec<u8>> {
        bincode::serialize(record).map_err(|e| CacheError::Io(std::io::Error::other(e)))
    }

    fn flush_all(&self) -> CacheResult<()> {
        self.db.flush().map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

#[async_trait]
impl CacheIndex for SledCacheIndex {
    async fn put(&self, mut meta: FileMeta, cancel: &CancellationToken) -> CacheResult<()> {
        check_cancelled(cancel)?;
        let now = Utc::now();
        if meta.atime_local.timestamp() == 0 {
            meta.atime_local = now;
        }
        if meta.mtime_remote.timestamp() == 0 {
            meta.mtime_remote = now;
        }

        let files = self.files.clone();
        let db = self.db.clone();
        spawn_blocking_named("index-put", move || -> CacheResult<()> {
            let encoded = SledCacheIndex::encode_meta(&meta)?;
            files
                .insert(meta.path.as_bytes(), encoded)
                .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            db.flush().map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn get(&self, path: &str, cancel: &CancellationToken) -> CacheResult<FileMeta> {
        check_cancelled(cancel)?;
        let files = self.files.clone();
        let db = self.db.clone();
        let path = path.to_string();
        spawn_blocking_named("index-get", move || -> CacheResult<FileMeta> {
            let bytes = files
                .get(path.as_bytes())
                .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
                .ok_or(CacheError::NotFound)?;
            let mut meta = SledCacheIndex::decode_meta(&bytes)?;
            meta.atime_local = Utc::now();
            let encoded = SledCacheIndex::encode_meta(&meta)?;
            files
                .insert(path.as_bytes(), encoded)
                .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            db.flush().map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            Ok(meta)
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn update(
        &self,
        path: &str,
        f: MetaMutation,
        cancel: &CancellationToken,
    ) -> CacheResult<FileMeta> {
        check_cancelled(cancel)?;
        let files = self.files.clone();
        let db = self.db.clone();
        let path_owned = path.to_string();
        spawn_blocking_named("index-update", move || -> CacheResult<FileMeta> {
            // Lock-free read-modify-write: retry on concurrent writer
            // interference so two concurrent `update` calls on the same
            // path never lose an update (spec §8).
            loop {
                let current = files
                    .get(path_owned.as_bytes())
                    .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
                    .ok_or(CacheError::NotFound)?;
                let mut meta = SledCacheIndex::decode_meta(&current)?;
                f(&mut meta);
                let encoded = SledCacheIndex::encode_meta(&meta)?;

                let cas = files
                    .compare_and_swap(path_owned.as_bytes(), Some(current.as_ref()), Some(encoded))
                    .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
                if cas.is_ok() {
                    db.flush().map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
                    return Ok(meta);
                }
                // Someone else mutated the entry between our read and
                // write; retry against the new value.
            }
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> CacheResult<()> {
        check_cancelled(cancel)?;
        let files = self.files.clone();
        let db = self.db.clone();
        let path = path.to_string();
        spawn_blocking_named("index-delete", move || -> CacheResult<()> {
            files
                .remove(path.as_bytes())
                .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            db.flush().map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn list_lru(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> CacheResult<Vec<FileMeta>> {
        check_cancelled(cancel)?;
        let files = self.files.clone();
        spawn_blocking_named("index-list-lru", move || -> CacheResult<Vec<FileMeta>> {
            let mut metas = Vec::new();
            for entry in files.iter() {
                let (_, value) = entry.map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
                metas.push(SledCacheIndex::decode_meta(&value)?);
            }
            metas.sort_by(|a, b| {
                a.atime_local
                    .cmp(&b.atime_local)
                    .then_with(|| a.path.cmp(&b.path))
            });
            if limit > 0 {
                metas.truncate(limit);
            }
            Ok(metas)
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn add_upload(
        &self,
        mut record: UploadRecord,
        cancel: &CancellationToken,
    ) -> CacheResult<UploadRecord> {
        check_cancelled(cancel)?;
        let uploads = self.uploads.clone();
        let stats = self.stats.clone();
        let db = self.db.clone();
        spawn_blocking_named("index-add-upload", move || -> CacheResult<UploadRecord> {
            use sled::transaction::ConflictableTransactionError as Conflict;

            let result = (&uploads, &stats).transaction(|(uploads, stats)| {
                let next_id = match stats.get(STATS_KEY)? {
                    Some(bytes) => {
                        let mut s: Stats = bincode::deserialize(&bytes)
                            .map_err(|e| Conflict::Abort(CacheError::Io(std::io::Error::other(e))))?;
                        s.upload_seq += 1;
                        let id = s.upload_seq;
                        let encoded = bincode::serialize(&s)
                            .map_err(|e| Conflict::Abort(CacheError::Io(std::io::Error::other(e))))?;
                        stats.insert(STATS_KEY, encoded)?;
                        id
                    }
                    None => {
                        return Err(Conflict::Abort(CacheError::Io(std::io::Error::other(
                            "stats bucket uninitialized",
                        ))));
                    }
                };

                if record.id == 0 {
                    record.id = next_id;
                }
                let now = Utc::now();
                record.created_at = now;
                record.updated_at = now;

                let encoded = bincode::serialize(&record)
                    .map_err(|e| Conflict::Abort(CacheError::Io(std::io::Error::other(e))))?;
                uploads.insert(&record.id.to_be_bytes(), encoded)?;
                Ok(record.clone())
            });

            let record = result.map_err(|e| match e {
                sled::transaction::TransactionError::Abort(err) => err,
                sled::transaction::TransactionError::Storage(e) => {
                    CacheError::Io(std::io::Error::other(e))
                }
            })?;

            db.flush().map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            Ok(record)
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn list_uploads(&self, cancel: &CancellationToken) -> CacheResult<Vec<UploadRecord>> {
        check_cancelled(cancel)?;
        let uploads = self.uploads.clone();
        spawn_blocking_named("index-list-uploads", move || -> CacheResult<Vec<UploadRecord>> {
            let mut records = Vec::new();
            for entry in uploads.iter() {
                let (_, value) = entry.map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
                records.push(SledCacheIndex::decode_record(&value)?);
            }
            // Keys are big-endian u64 ids, so tree iteration order already
            // matches ascending id order; sort defensively for clarity.
            records.sort_by_key(|r| r.id);
            Ok(records)
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn update_upload_status(
        &self,
        id: u64,
        status: UploadStatus,
        last_error: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<UploadRecord> {
        check_cancelled(cancel)?;
        let uploads = self.uploads.clone();
        let db = self.db.clone();
        let last_error = last_error.to_string();
        spawn_blocking_named("index-update-upload-status", move || -> CacheResult<UploadRecord> {
            loop {
                let key = id.to_be_bytes();
                let current = uploads
                    .get(key)
                    .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
                    .ok_or(CacheError::NotFound)?;
                let mut record = SledCacheIndex::decode_record(&current)?;

                record.status = status;
                record.attempts += 1;
                record.last_error = last_error.clone();
                let prev_updated = record.updated_at;
                let mut now = Utc::now();
                if now <= prev_updated {
                    now = prev_updated + chrono::Duration::nanoseconds(1);
                }
                record.updated_at = now;

                let encoded = SledCacheIndex::encode_record(&record)?;
                let cas = uploads
                    .compare_and_swap(key, Some(current.as_ref()), Some(encoded))
                    .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
                if cas.is_ok() {
                    db.flush().map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
                    return Ok(record);
                }
            }
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn stats(&self, cancel: &CancellationToken) -> CacheResult<Stats> {
        check_cancelled(cancel)?;
        let stats = self.stats.clone();
        spawn_blocking_named("index-stats", move || -> CacheResult<Stats> {
            Ok(migration::read_stats(&stats)?.unwrap_or_default())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    async fn close(&self) -> CacheResult<()> {
        self.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChunkMeta;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();
        let mut meta = FileMeta::new("a");
        meta.size = 11;
        meta.chunks.push(ChunkMeta {
            offset: 0,
            length: 11,
            dirty: false,
        });
        index.put(meta.clone(), &cancel()).await.unwrap();

        let fetched = index.get("a", &cancel()).await.unwrap();
        assert_eq!(fetched.path, "a");
        assert_eq!(fetched.size, 11);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();
        let err = index.get("missing", &cancel()).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();
        index.delete("never-existed", &cancel()).await.unwrap();
        index.delete("never-existed", &cancel()).await.unwrap();
    }

    #[tokio::test]
    async fn list_lru_orders_by_atime_then_path() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();

        for (name, secs_ago) in [("b", 1), ("a", 1), ("c", 2)] {
            let mut meta = FileMeta::new(name);
            meta.atime_local = Utc::now() - chrono::Duration::seconds(secs_ago);
            index.put(meta, &cancel()).await.unwrap();
        }

        let lru = index.list_lru(0, &cancel()).await.unwrap();
        let names: Vec<_> = lru.iter().map(|m| m.path.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn list_lru_limit_zero_is_unlimited() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();
        for name in ["a", "b", "c"] {
            index.put(FileMeta::new(name), &cancel()).await.unwrap();
        }
        assert_eq!(index.list_lru(0, &cancel()).await.unwrap().len(), 3);
        assert_eq!(index.list_lru(100, &cancel()).await.unwrap().len(), 3);
        assert_eq!(index.list_lru(1, &cancel()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_upload_assigns_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();
        let r1 = index
            .add_upload(UploadRecord::new("a", 0, 4), &cancel())
            .await
            .unwrap();
        let r2 = index
            .add_upload(UploadRecord::new("a", 4, 4), &cancel())
            .await
            .unwrap();
        assert_eq!(r1.id, 1);
        assert_eq!(r2.id, 2);

        let all = index.list_uploads(&cancel()).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn update_upload_status_increments_attempts_and_updated_at() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();
        let record = index
            .add_upload(UploadRecord::new("a", 0, 4), &cancel())
            .await
            .unwrap();

        let first = index
            .update_upload_status(record.id, UploadStatus::InProgress, "", &cancel())
            .await
            .unwrap();
        assert_eq!(first.attempts, 1);

        let second = index
            .update_upload_status(record.id, UploadStatus::Complete, "", &cancel())
            .await
            .unwrap();
        assert_eq!(second.attempts, 2);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn update_upload_status_unknown_id_not_found() {
        let dir = TempDir::new().unwrap();
        let index = SledCacheIndex::open(dir.path().join("index.db")).unwrap();
        let err = index
            .update_upload_status(999, UploadStatus::Failed, "x", &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound));
    }

    #[tokio::test]
    async fn reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.db");
        {
            let index = SledCacheIndex::open(&path).unwrap();
            index.put(FileMeta::new("a"), &cancel()).await.unwrap();
            index
                .add_upload(UploadRecord::new("a", 0, 4), &cancel())
                .await
                .unwrap();
            index.close().await.unwrap();
        }
        let reopened = SledCacheIndex::open(&path).unwrap();
        assert_eq!(reopened.get("a", &cancel()).await.unwrap().path, "a");
        assert_eq!(reopened.list_uploads(&cancel()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_updates_never_lose_a_write() {
        let dir = TempDir::new().unwrap();
        let index = std::sync::Arc::new(SledCacheIndex::open(dir.path().join("index.db")).unwrap());
        index.put(FileMeta::new("a"), &cancel()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index
                    .update(
                        "a",
                        Box::new(move |meta| meta.size += i + 1),
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let total: u64 = (1..=20).sum();
        let meta = index.get("a", &cancel()).await.unwrap();
        assert_eq!(meta.size, total);
    }
}
