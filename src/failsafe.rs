//! ENOSPC recovery coordinator (spec §4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cleaner::Cleaner;
use crate::error::{CacheError, CacheResult};
use crate::metrics::MetricsSink;
use crate::uploader::UploaderController;

pub struct FailsafeMonitor {
    cleaner: Arc<Cleaner>,
    uploader: Arc<dyn UploaderController>,
    recovering: AtomicBool,
}

impl FailsafeMonitor {
    pub fn new(cleaner: Arc<Cleaner>, uploader: Arc<dyn UploaderController>) -> Self {
        Self {
            cleaner,
            uploader,
            recovering: AtomicBool::new(false),
        }
    }

    /// Coordinate ENOSPC recovery (spec §4.6, "HandleENOSPC").
    pub async fn handle_enospc(
        &self,
        metrics: &dyn MetricsSink,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return Err(CacheError::RecoveryInProgress);
        }
        let result = self.run_recovery(metrics, cancel).await;
        self.recovering.store(false, Ordering::SeqCst);
        result
    }

    async fn run_recovery(
        &self,
        metrics: &dyn MetricsSink,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        info!("entering ENOSPC recovery");
        self.uploader.pause(cancel).await?;

        match self.cleaner.run_once(true, metrics, cancel).await {
            Ok(outcome) => {
                info!(evicted = outcome.evicted, "ENOSPC recovery cleaner pass succeeded");
                self.uploader.resume(cancel).await?;
                Ok(())
            }
            Err(CacheError::FatalCondition(msg)) => {
                error!("ENOSPC recovery failed fatally, leaving uploader paused: {msg}");
                Err(CacheError::RecoveryFailed(msg))
            }
            Err(e) => {
                if let Err(resume_err) = self.uploader.resume(cancel).await {
                    warn!("failed to resume uploader after cleaner error: {resume_err}");
                }
                Err(e)
            }
        }
    }
}
