//! Metrics sink consumed by the uploader and cleaner (spec §4.3: "a metrics
//! sink"). Grounded on the teacher's atomic-counter-struct stats pattern
//! (`WritebackCacheStats`, `MetadataCacheStats`).

use std::sync::atomic::{AtomicU64, Ordering};

/// Narrow interface so the uploader/cleaner don't depend on a concrete
/// counter type; a host can supply its own sink (e.g. one wired into an
/// external metrics registry) in place of `AtomicMetrics`.
pub trait MetricsSink: Send + Sync {
    fn record_upload_queued(&self) {}
    fn record_upload_complete(&self) {}
    fn record_upload_retry(&self) {}
    fn record_upload_failed(&self) {}
    fn record_etag_mismatch(&self) {}
    fn record_eviction(&self, bytes: u64) {
        let _ = bytes;
    }
}

/// Default in-process implementation backed by atomics.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    pub uploads_queued: AtomicU64,
    pub uploads_complete: AtomicU64,
    pub uploads_retried: AtomicU64,
    pub uploads_failed: AtomicU64,
    pub etag_mismatches: AtomicU64,
    pub evictions: AtomicU64,
    pub evicted_bytes: AtomicU64,
}

impl MetricsSink for AtomicMetrics {
    fn record_upload_queued(&self) {
        self.uploads_queued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_upload_complete(&self) {
        self.uploads_complete.fetch_add(1, Ordering::Relaxed);
    }

    fn record_upload_retry(&self) {
        self.uploads_retried.fetch_add(1, Ordering::Relaxed);
    }

    fn record_upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_etag_mismatch(&self) {
        self.etag_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// A no-op sink for tests and hosts that don't care about metrics.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {}
