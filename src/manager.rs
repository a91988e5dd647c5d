//! Lifecycle orchestration and the public façade the host calls (spec §4.7).

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::chunk_provider::{ChunkProvider, ContainerChunkProvider};
use crate::cleaner::{Cleaner, CleanerConfig, DiskUsageProbe, StatvfsProbe};
use crate::config::Settings;
use crate::container::ContainerStore;
use crate::error::{CacheError, CacheResult};
use crate::failsafe::FailsafeMonitor;
use crate::index::{CacheIndex, SledCacheIndex};
use crate::lock_manager::LockManager;
use crate::lockfile::LockFile;
use crate::metrics::MetricsSink;
use crate::model::{FileMeta, UploadRecord};
use crate::task::spawn_named;
use crate::uploader::{Uploader, UploaderConfig, UploaderController};

pub struct CacheManager {
    settings: Settings,
    container_store: ContainerStore,
    index: Arc<dyn CacheIndex>,
    uploader: Arc<Uploader>,
    cleaner: Arc<Cleaner>,
    failsafe: FailsafeMonitor,
    metrics: Arc<dyn MetricsSink>,
    locks: LockManager,
    cache_root: std::path::PathBuf,
    cancel: CancellationToken,
    lock_file: std::sync::Mutex<Option<LockFile>>,
    uploader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    cleaner_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Build a manager around a concrete `Backend`, using the default
    /// `sled`/`ContainerStore`/`StatvfsProbe` stack for everything else.
    pub fn new(
        settings: Settings,
        disk_id: &str,
        backend: Arc<dyn Backend>,
        metrics: Arc<dyn MetricsSink>,
    ) -> CacheResult<Self> {
        settings.validate()?;
        let cache_root = settings.resolved_cache_dir(disk_id);

        let index: Arc<dyn CacheIndex> =
            Arc::new(SledCacheIndex::open(cache_root.join("index.db"))?);
        let container_store = ContainerStore::new(&cache_root);
        let chunk_provider: Arc<dyn ChunkProvider> =
            Arc::new(ContainerChunkProvider::new(&container_store));
        let disk_probe: Arc<dyn DiskUsageProbe> = Arc::new(StatvfsProbe::new(&cache_root));

        let cancel = CancellationToken::new();
        let uploader = Uploader::new(
            index.clone(),
            chunk_provider,
            backend,
            metrics.clone(),
            UploaderConfig::from_settings(&settings),
            cancel.clone(),
        );
        let cleaner = Arc::new(Cleaner::new(
            index.clone(),
            disk_probe,
            cache_root.join("objects"),
            CleanerConfig {
                max_cache_bytes: settings.cache_size_bytes(),
                min_free_percent: settings.fail_safe.disk_min_free_percent,
            },
        ));
        let failsafe = FailsafeMonitor::new(cleaner.clone(), uploader.clone() as Arc<dyn UploaderController>);

        Ok(Self {
            settings,
            container_store,
            index,
            uploader,
            cleaner,
            failsafe,
            metrics,
            locks: LockManager::new(),
            cache_root,
            cancel,
            lock_file: std::sync::Mutex::new(None),
            uploader_handle: std::sync::Mutex::new(None),
            cleaner_handle: std::sync::Mutex::new(None),
        })
    }

    /// Open the index, acquire the `.lock` file, and start the uploader and
    /// cleaner background loops (spec §4.7, "start").
    pub async fn start(&self) -> CacheResult<()> {
        info!(root = %self.cache_root.display(), "starting cache manager");
        let lock = LockFile::acquire(&self.cache_root)?;
        *self.lock_file.lock().unwrap() = Some(lock);

        let uploader_handle = self.uploader.spawn();
        *self.uploader_handle.lock().unwrap() = Some(uploader_handle);

        let cleaner_handle = self.spawn_cleaner_loop();
        *self.cleaner_handle.lock().unwrap() = Some(cleaner_handle);

        Ok(())
    }

    fn spawn_cleaner_loop(&self) -> JoinHandle<()> {
        let cleaner = self.cleaner.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let interval = std::time::Duration::from_secs(self.settings.clean_interval_min * 60);
        spawn_named("cleaner-loop", async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cleaner.run_once(false, metrics.as_ref(), &cancel).await {
                            tracing::warn!("periodic cleaner pass failed: {e}");
                        }
                    }
                }
            }
        })
    }

    /// Cancel background loops, wait for them to drain, and fsync-close the
    /// index (spec §4.7, "stop").
    pub async fn stop(&self) -> CacheResult<()> {
        info!("stopping cache manager");
        self.cancel.cancel();

        if let Some(handle) = self.uploader_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.cleaner_handle.lock().unwrap().take() {
            let _ = handle.await;
        }

        self.index.close().await?;
        *self.lock_file.lock().unwrap() = None;
        Ok(())
    }

    /// Return cached bytes for `[offset, offset+length)` if present.
    /// `Ok(None)` signals a cache miss the host must fetch and then fill via
    /// `write_range(..., dirty=false)`.
    pub async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> CacheResult<Option<Bytes>> {
        let cancel = CancellationToken::new();
        let meta = match self.index.get(path, &cancel).await {
            Ok(m) => m,
            Err(CacheError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        if length == 0 {
            return Ok(Some(Bytes::new()));
        }
        let end = offset + length;
        let covered = meta
            .chunks
            .iter()
            .any(|c| c.offset <= offset && c.end() >= end);
        if !covered {
            return Ok(None);
        }

        let container = self.container_store.open(path).await?;
        let bytes = container
            .read_at(vec![0u8; length as usize], offset)
            .await?;
        Ok(Some(Bytes::from(bytes)))
    }

    /// Write `bytes` at `offset` of `path`; merges the chunk list and, when
    /// `dirty`, appends an `UploadRecord` (spec §4.7, "write_range").
    ///
    /// An `ENOSPC` writing to the container is always recovered through
    /// `FailsafeMonitor` before being surfaced to the host (spec §5,
    /// "Shared-resource policy"): the write is retried exactly once after a
    /// successful recovery pass.
    pub async fn write_range(
        &self,
        path: &str,
        offset: u64,
        bytes: Bytes,
        dirty: bool,
    ) -> CacheResult<()> {
        let _guard = self.locks.acquire(path).await;
        let cancel = CancellationToken::new();
        let length = bytes.len() as u64;

        match self.write_container(path, offset, bytes.clone()).await {
            Ok(()) => {}
            Err(e) if is_enospc(&e) => {
                warn!(%path, "ENOSPC writing container, invoking failsafe recovery");
                self.failsafe
                    .handle_enospc(self.metrics.as_ref(), &cancel)
                    .await?;
                self.write_container(path, offset, bytes).await?;
            }
            Err(e) => return Err(e),
        }

        match self.index.get(path, &cancel).await {
            Ok(_) => {}
            Err(CacheError::NotFound) => {
                self.index.put(FileMeta::new(path), &cancel).await?;
            }
            Err(e) => return Err(e),
        }

        self.index
            .update(
                path,
                Box::new(move |meta| meta.merge_chunk(offset, length, dirty)),
                &cancel,
            )
            .await?;

        if dirty {
            self.index
                .add_upload(UploadRecord::new(path, offset, length), &cancel)
                .await?;
        }

        Ok(())
    }

    /// Drop local state for `path` whose remote etag changed; dirty ranges
    /// are marked failed with `ETagMismatch` for manual reconciliation
    /// (spec §4.7, "invalidate").
    pub async fn invalidate(&self, path: &str) -> CacheResult<()> {
        let _guard = self.locks.acquire(path).await;
        let cancel = CancellationToken::new();

        let uploads = self.index.list_uploads(&cancel).await?;
        for record in uploads {
            if record.path != path {
                continue;
            }
            if matches!(
                record.status,
                crate::model::UploadStatus::Complete | crate::model::UploadStatus::Failed
            ) {
                continue;
            }
            self.index
                .update_upload_status(
                    record.id,
                    crate::model::UploadStatus::Failed,
                    "etag mismatch: invalidated",
                    &cancel,
                )
                .await?;
        }

        self.index.delete(path, &cancel).await?;
        Ok(())
    }

    pub fn index(&self) -> &Arc<dyn CacheIndex> {
        &self.index
    }

    async fn write_container(&self, path: &str, offset: u64, bytes: Bytes) -> CacheResult<()> {
        let container = self.container_store.open(path).await?;
        container.write_at(bytes.to_vec(), offset).await?;
        container.fsync().await?;
        container.close().await
    }
}

fn is_enospc(err: &CacheError) -> bool {
    matches!(err, CacheError::Io(e) if e.raw_os_error() == Some(libc::ENOSPC))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::ScriptedBackend;
    use crate::metrics::NullMetrics;
    use tempfile::TempDir;

    fn settings_for(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.cache_dir = dir.path().to_string_lossy().into_owned();
        settings.cache_size_gb = 1.0;
        settings
    }

    #[tokio::test]
    async fn write_then_read_round_trips_even_after_restart() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(())]));
        let manager = CacheManager::new(
            settings_for(&dir),
            "disk-1",
            backend,
            Arc::new(NullMetrics),
        )
        .unwrap();
        manager.start().await.unwrap();

        manager
            .write_range("a", 0, Bytes::from_static(b"hello world"), true)
            .await
            .unwrap();

        let bytes = manager.read_range("a", 6, 5).await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), b"world");

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn read_miss_on_unknown_path_returns_none() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(())]));
        let manager = CacheManager::new(
            settings_for(&dir),
            "disk-1",
            backend,
            Arc::new(NullMetrics),
        )
        .unwrap();
        manager.start().await.unwrap();

        let result = manager.read_range("never-written", 0, 4).await.unwrap();
        assert!(result.is_none());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_fails_pending_uploads_for_path() {
        // Deliberately does not call start(): the uploader background loop
        // would race to drain the queued upload before invalidate() runs.
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![Err(
            crate::backend::UploadErrorKind::Retryable,
        )]));
        let manager = CacheManager::new(
            settings_for(&dir),
            "disk-1",
            backend,
            Arc::new(NullMetrics),
        )
        .unwrap();

        manager
            .write_range("a", 0, Bytes::from_static(b"dirty-bytes"), true)
            .await
            .unwrap();
        manager.invalidate("a").await.unwrap();

        let uploads = manager
            .index()
            .list_uploads(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].status, crate::model::UploadStatus::Failed);

        let meta = manager.index().get("a", &CancellationToken::new()).await;
        assert!(matches!(meta, Err(CacheError::NotFound)));
    }
}
