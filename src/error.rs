//! Error taxonomy exported to the filesystem host.
//!
//! Internal helpers that are not part of the public contract may still
//! return `anyhow::Result` (see e.g. `config`); this enum is reserved for
//! the errors the host is expected to pattern-match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("not found")]
    NotFound,

    #[error("config file missing; a template has been written")]
    ConfigMissing,

    #[error("invalid configuration: {0:?}")]
    ValidationError(Vec<String>),

    #[error("unknown schema version {found} (expected {expected})")]
    UnknownSchema { found: u32, expected: u32 },

    #[error("etag mismatch")]
    ETagMismatch,

    #[error("cache capacity could not be reduced to the configured limit")]
    CapacityNotReduced,

    #[error("fatal condition: {0}")]
    FatalCondition(String),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("recovery already in progress")]
    RecoveryInProgress,

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;
