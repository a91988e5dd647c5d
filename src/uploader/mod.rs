//! Concurrent, retrying, backoff-driven flusher of dirty ranges (spec §4.3).
//!
//! Grounded on the teacher's `WritebackCache` background-flush pattern
//! (`writeback_cache.rs`): a `Semaphore` bounding concurrency, an
//! `interval`-driven scan loop, per-item work spawned onto its own task.
//! Cancellation is threaded through explicitly here rather than the
//! teacher's `AtomicBool` flag, matching every other component's contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, UploadErrorKind};
use crate::chunk_provider::ChunkProvider;
use crate::config::Settings;
use crate::error::CacheResult;
use crate::index::CacheIndex;
use crate::metrics::MetricsSink;
use crate::model::{UploadRecord, UploadStatus};
use crate::task::spawn_named;

const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct UploaderConfig {
    pub max_concurrent_uploads: usize,
    pub max_attempts: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub poll_interval: Duration,
}

impl UploaderConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrent_uploads: settings.upload.max_concurrent_uploads,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_retry_delay: Duration::from_secs(settings.upload.retry_interval_sec),
            max_retry_delay: Duration::from_secs(settings.upload.max_retry_sec),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// `delay(n) = clamp(base * 2^(n-1), base, max)` (spec §4.3, "Backoff").
fn backoff_delay(n: u32, base: Duration, max: Duration) -> Duration {
    let scaled = base.saturating_mul(1u32 << n.saturating_sub(1).min(31));
    scaled.clamp(base, max)
}

#[async_trait]
pub trait UploaderController: Send + Sync {
    async fn pause(&self, cancel: &CancellationToken) -> CacheResult<()>;
    async fn resume(&self, cancel: &CancellationToken) -> CacheResult<()>;
}

pub struct Uploader {
    index: Arc<dyn CacheIndex>,
    chunks: Arc<dyn ChunkProvider>,
    backend: Arc<dyn Backend>,
    metrics: Arc<dyn MetricsSink>,
    config: UploaderConfig,
    paused: AtomicBool,
    queued_ids: DashSet<u64>,
    inflight_ids: DashSet<u64>,
    semaphore: Semaphore,
    cancel: CancellationToken,
}

impl Uploader {
    pub fn new(
        index: Arc<dyn CacheIndex>,
        chunks: Arc<dyn ChunkProvider>,
        backend: Arc<dyn Backend>,
        metrics: Arc<dyn MetricsSink>,
        config: UploaderConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let permits = config.max_concurrent_uploads;
        Arc::new(Self {
            index,
            chunks,
            backend,
            metrics,
            config,
            paused: AtomicBool::new(false),
            queued_ids: DashSet::new(),
            inflight_ids: DashSet::new(),
            semaphore: Semaphore::new(permits),
            cancel,
        })
    }

    /// Start the background scan loop. The returned handle finishes once the
    /// uploader's `CancellationToken` is cancelled.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        spawn_named("uploader-scan-loop", async move { Self::scan_loop(this).await })
    }

    async fn scan_loop(this: Arc<Self>) {
        info!("uploader scan loop starting");
        let mut ticker = tokio::time::interval(this.config.poll_interval);
        loop {
            tokio::select! {
                _ = this.cancel.cancelled() => {
                    info!("uploader scan loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if this.paused.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Err(e) = Self::scan_once(&this).await {
                        warn!("uploader scan failed: {e}");
                    }
                }
            }
        }
    }

    async fn scan_once(this: &Arc<Self>) -> CacheResult<()> {
        let records = this.index.list_uploads(&this.cancel).await?;
        for record in records {
            if matches!(record.status, UploadStatus::Complete | UploadStatus::Failed) {
                continue;
            }
            if this.inflight_ids.contains(&record.id) {
                continue;
            }
            if !this.queued_ids.insert(record.id) {
                continue;
            }
            this.metrics.record_upload_queued();

            let worker_this = Arc::clone(this);
            let id = record.id;
            spawn_named("uploader-worker", async move {
                worker_this.queued_ids.remove(&id);
                worker_this.inflight_ids.insert(id);
                Self::process_record(Arc::clone(&worker_this), record).await;
                worker_this.inflight_ids.remove(&id);
            });
        }
        Ok(())
    }

    async fn process_record(this: Arc<Self>, mut record: UploadRecord) {
        loop {
            let permit = tokio::select! {
                _ = this.cancel.cancelled() => return,
                permit = this.semaphore.acquire() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            let in_progress = match this
                .index
                .update_upload_status(record.id, UploadStatus::InProgress, "", &this.cancel)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(id = record.id, "failed to mark upload in_progress: {e}");
                    drop(permit);
                    return;
                }
            };

            let reader = match this.chunks.open_chunk(&in_progress).await {
                Ok(r) => r,
                Err(e) => {
                    let _ = this
                        .index
                        .update_upload_status(
                            record.id,
                            UploadStatus::Failed,
                            &e.to_string(),
                            &this.cancel,
                        )
                        .await;
                    this.metrics.record_upload_failed();
                    drop(permit);
                    return;
                }
            };

            let outcome = tokio::select! {
                _ = this.cancel.cancelled() => None,
                result = this.backend.upload(&in_progress, reader) => Some(result),
            };
            drop(permit);

            match outcome {
                None => {
                    let _ = this
                        .index
                        .update_upload_status(
                            record.id,
                            UploadStatus::Queued,
                            "cancelled",
                            &CancellationToken::new(),
                        )
                        .await;
                    return;
                }
                Some(Ok(())) => {
                    let _ = this
                        .index
                        .update_upload_status(record.id, UploadStatus::Complete, "", &this.cancel)
                        .await;
                    let (path, offset, length) =
                        (in_progress.path.clone(), in_progress.offset, in_progress.length);
                    if let Err(e) = this
                        .index
                        .update(
                            &path,
                            Box::new(move |meta| meta.clear_dirty(offset, length)),
                            &this.cancel,
                        )
                        .await
                    {
                        warn!(id = record.id, "failed to clear dirty flag after upload: {e}");
                    }
                    this.metrics.record_upload_complete();
                    return;
                }
                Some(Err(err)) => match err.kind {
                    UploadErrorKind::ETagMismatch => {
                        let _ = this
                            .index
                            .update_upload_status(
                                record.id,
                                UploadStatus::Failed,
                                &err.message,
                                &this.cancel,
                            )
                            .await;
                        this.metrics.record_etag_mismatch();
                        this.metrics.record_upload_failed();
                        return;
                    }
                    UploadErrorKind::NonRetryable => {
                        let _ = this
                            .index
                            .update_upload_status(
                                record.id,
                                UploadStatus::Failed,
                                &err.message,
                                &this.cancel,
                            )
                            .await;
                        this.metrics.record_upload_failed();
                        return;
                    }
                    UploadErrorKind::Retryable => {
                        let call_number = in_progress.observed_retries() + 1;
                        if call_number >= this.config.max_attempts {
                            let _ = this
                                .index
                                .update_upload_status(
                                    record.id,
                                    UploadStatus::Failed,
                                    &err.message,
                                    &this.cancel,
                                )
                                .await;
                            this.metrics.record_upload_failed();
                            return;
                        }

                        record = match this
                            .index
                            .update_upload_status(
                                record.id,
                                UploadStatus::Queued,
                                &err.message,
                                &this.cancel,
                            )
                            .await
                        {
                            Ok(r) => r,
                            Err(_) => return,
                        };
                        this.metrics.record_upload_retry();

                        let delay = backoff_delay(
                            call_number,
                            this.config.base_retry_delay,
                            this.config.max_retry_delay,
                        );
                        debug!(id = record.id, ?delay, "retrying upload after backoff");
                        tokio::select! {
                            _ = this.cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
    }
}

#[async_trait]
impl UploaderController for Uploader {
    async fn pause(&self, _cancel: &CancellationToken) -> CacheResult<()> {
        self.paused.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn resume(&self, _cancel: &CancellationToken) -> CacheResult<()> {
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }
}
