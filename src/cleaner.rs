//! LRU-based capacity and free-space enforcer (spec §4.5).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::index::CacheIndex;
use crate::metrics::MetricsSink;

/// Total and free bytes on the filesystem backing the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
}

pub trait DiskUsageProbe: Send + Sync {
    fn usage(&self) -> CacheResult<DiskUsage>;
}

/// `libc::statvfs`-backed probe, grounded on the pack's storage-engine
/// examples that query filesystem free space directly rather than
/// estimating it from tracked byte counts.
pub struct StatvfsProbe {
    path: PathBuf,
}

impl StatvfsProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskUsageProbe for StatvfsProbe {
    fn usage(&self) -> CacheResult<DiskUsage> {
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(self.path.as_os_str().as_bytes())
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(CacheError::Io(std::io::Error::last_os_error()));
        }

        let block_size = stat.f_frsize as u64;
        Ok(DiskUsage {
            total: block_size * stat.f_blocks as u64,
            free: block_size * stat.f_bavail as u64,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CleanerConfig {
    pub max_cache_bytes: u64,
    pub min_free_percent: u8,
}

pub struct RunOutcome {
    pub evicted: usize,
    pub usage_after: u64,
}

/// One invocation at a time; the internal mutex makes concurrent callers
/// (periodic timer, FailsafeMonitor, host on-demand) observe a sequential,
/// atomic pass (spec §4.5, "Concurrency").
pub struct Cleaner {
    index: Arc<dyn CacheIndex>,
    disk: Arc<dyn DiskUsageProbe>,
    objects_root: PathBuf,
    config: CleanerConfig,
    run_lock: Mutex<()>,
}

impl Cleaner {
    pub fn new(
        index: Arc<dyn CacheIndex>,
        disk: Arc<dyn DiskUsageProbe>,
        objects_root: impl Into<PathBuf>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            index,
            disk,
            objects_root: objects_root.into(),
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Run a single pass. `emergency` bounds eviction by free-space
    /// percentage rather than (only) `max_cache_bytes` (spec §4.5 step 3-4).
    pub async fn run_once(
        &self,
        emergency: bool,
        metrics: &dyn MetricsSink,
        cancel: &CancellationToken,
    ) -> CacheResult<RunOutcome> {
        let _guard = self.run_lock.lock().await;

        let metas = self.index.list_lru(0, cancel).await?;
        let mut usage: u64 = metas.iter().map(|m| m.size).sum();

        let disk = self.disk.usage()?;
        let required_free = disk.total * self.config.min_free_percent as u64 / 100;
        let limit = if self.config.max_cache_bytes == 0 {
            u64::MAX
        } else {
            self.config.max_cache_bytes
        };

        let mut free = disk.free;
        let mut evicted = 0usize;

        for meta in metas {
            let capacity_ok = usage <= limit;
            let free_ok = !emergency || free >= required_free;
            if capacity_ok && free_ok {
                break;
            }
            if meta.has_dirty_chunk() {
                debug!(path = %meta.path, "skipping dirty file, not evictable");
                continue;
            }

            self.evict(&meta.path, cancel).await?;
            usage = usage.saturating_sub(meta.size);
            free = free.saturating_add(meta.size);
            metrics.record_eviction(meta.size);
            evicted += 1;
        }

        if emergency {
            let post = self.disk.usage()?;
            if post.free < required_free {
                warn!(free = post.free, required_free, "emergency eviction left free space below threshold");
                return Err(CacheError::FatalCondition(
                    "free space remains below threshold after emergency eviction".to_string(),
                ));
            }
        } else if usage > limit {
            warn!(usage, limit, "cleaner pass could not reduce usage to the configured limit");
            return Err(CacheError::CapacityNotReduced);
        }

        info!(evicted, usage, "cleaner pass complete");
        Ok(RunOutcome {
            evicted,
            usage_after: usage,
        })
    }

    async fn evict(&self, path: &str, cancel: &CancellationToken) -> CacheResult<()> {
        let file_path = crate::container::safe_join(&self.objects_root, path)?;
        match tokio::fs::remove_file(&file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::Io(e)),
        }
        self.index.delete(path, cancel).await?;
        remove_empty_ancestors(&self.objects_root, &file_path).await;
        Ok(())
    }
}

async fn remove_empty_ancestors(root: &Path, file_path: &Path) {
    let mut dir = file_path.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == *root || !d.starts_with(root) {
            break;
        }
        match tokio::fs::remove_dir(&d).await {
            Ok(()) => dir = d.parent().map(Path::to_path_buf),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SledCacheIndex;
    use crate::metrics::NullMetrics;
    use crate::model::FileMeta;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    struct FixedDisk(DiskUsage);
    impl DiskUsageProbe for FixedDisk {
        fn usage(&self) -> CacheResult<DiskUsage> {
            Ok(self.0)
        }
    }

    async fn put_file(index: &dyn CacheIndex, root: &Path, path: &str, size: u64, atime_offset_secs: i64) {
        let file_path = crate::container::safe_join(&root.join("objects"), path).unwrap();
        tokio::fs::create_dir_all(file_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&file_path, vec![0u8; size as usize]).await.unwrap();

        let mut meta = FileMeta::new(path);
        meta.size = size;
        meta.atime_local = Utc::now() + ChronoDuration::seconds(atime_offset_secs);
        index.put(meta, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn evicts_lru_until_under_limit() {
        let dir = TempDir::new().unwrap();
        let index: Arc<dyn CacheIndex> =
            Arc::new(SledCacheIndex::open(dir.path().join("index.db")).unwrap());
        put_file(index.as_ref(), dir.path(), "a", 40, 0).await;
        put_file(index.as_ref(), dir.path(), "b", 30, 1).await;
        put_file(index.as_ref(), dir.path(), "c", 20, 2).await;

        let disk = Arc::new(FixedDisk(DiskUsage {
            total: 1000,
            free: 900,
        }));
        let cleaner = Cleaner::new(
            index.clone(),
            disk,
            dir.path().join("objects"),
            CleanerConfig {
                max_cache_bytes: 60,
                min_free_percent: 0,
            },
        );

        let outcome = cleaner
            .run_once(false, &NullMetrics, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.evicted, 1);
        assert_eq!(outcome.usage_after, 50);

        let remaining = index.list_lru(0, &CancellationToken::new()).await.unwrap();
        let names: Vec<_> = remaining.iter().map(|m| m.path.clone()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn dirty_file_resists_eviction_and_reports_fatal_in_emergency() {
        let dir = TempDir::new().unwrap();
        let index: Arc<dyn CacheIndex> =
            Arc::new(SledCacheIndex::open(dir.path().join("index.db")).unwrap());

        put_file(index.as_ref(), dir.path(), "dirty", 60, 0).await;
        index
            .update(
                "dirty",
                Box::new(|meta| meta.merge_chunk(0, 60, true)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        put_file(index.as_ref(), dir.path(), "clean", 30, 1).await;

        let disk = Arc::new(FixedDisk(DiskUsage {
            total: 100,
            free: 10,
        }));
        let cleaner = Cleaner::new(
            index.clone(),
            disk,
            dir.path().join("objects"),
            CleanerConfig {
                max_cache_bytes: 50,
                min_free_percent: 50,
            },
        );

        let err = cleaner
            .run_once(true, &NullMetrics, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::FatalCondition(_)));

        let remaining = index.list_lru(0, &CancellationToken::new()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, "dirty");
    }

    #[tokio::test]
    async fn concurrent_runs_are_serialized() {
        let dir = TempDir::new().unwrap();
        let index: Arc<dyn CacheIndex> =
            Arc::new(SledCacheIndex::open(dir.path().join("index.db")).unwrap());
        put_file(index.as_ref(), dir.path(), "a", 10, 0).await;

        let disk = Arc::new(FixedDisk(DiskUsage {
            total: 1000,
            free: 900,
        }));
        let cleaner = Arc::new(Cleaner::new(
            index.clone(),
            disk,
            dir.path().join("objects"),
            CleanerConfig {
                max_cache_bytes: 0,
                min_free_percent: 0,
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cleaner = cleaner.clone();
            handles.push(tokio::spawn(async move {
                cleaner
                    .run_once(false, &NullMetrics, &CancellationToken::new())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
