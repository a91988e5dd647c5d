//! The pluggable object-store interface consumed by the Uploader (spec §6,
//! "Backend interface"). The S3 protocol client itself is out of scope
//! (spec §1); this crate only defines the seam.

use async_trait::async_trait;

use crate::chunk_provider::ChunkReader;
use crate::model::UploadRecord;

/// How the Uploader should react to a failed `Backend::upload` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// Transient (network, 5xx): retry under backoff up to `max_attempts`.
    Retryable,
    /// Permanent: fail the record immediately, no retry.
    NonRetryable,
    /// Remote object changed since the cache last observed it: fail the
    /// record immediately; the host must reconcile (spec §4.3 step 6).
    ETagMismatch,
}

#[derive(Debug)]
pub struct UploadError {
    pub kind: UploadErrorKind,
    pub message: String,
}

impl UploadError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: UploadErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: UploadErrorKind::NonRetryable,
            message: message.into(),
        }
    }

    pub fn etag_mismatch(message: impl Into<String>) -> Self {
        Self {
            kind: UploadErrorKind::ETagMismatch,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UploadError {}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Upload exactly `record.length` bytes from `reader` to `record.path`.
    async fn upload(
        &self,
        record: &UploadRecord,
        reader: Box<dyn ChunkReader>,
    ) -> Result<(), UploadError>;
}
