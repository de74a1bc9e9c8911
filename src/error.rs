use std::time::Duration;

use thiserror::Error;

use crate::checksum::Checksum;

/// Errors surfaced by the cache and execution engine
#[derive(Error, Debug)]
pub enum SeamlessError {
    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    /// Checksum is known but its buffer cannot be obtained from any tier
    #[error("cache miss: {0}")]
    CacheMiss(Checksum),

    #[error("checksum mismatch: expected {expected}, buffer hashes to {actual}")]
    ChecksumMismatch { expected: Checksum, actual: Checksum },

    #[error("cannot convert {celltype} value: {reason}")]
    Codec { celltype: String, reason: String },

    #[error("invalid transformation: {0}")]
    InvalidTransformation(String),

    /// Recorded execution failure of a transformation
    #[error("transformation {checksum} failed: {message}")]
    Transformation { checksum: Checksum, message: String },

    #[error("unknown transformation result for {0}")]
    UnknownTransformation(Checksum),

    #[error("transformation {checksum} is still referenced by {referrers} transformer(s)")]
    StillReferenced { checksum: Checksum, referrers: usize },

    #[error("database refused request ({status}): {text}")]
    DatabaseRefused { status: u16, text: String },

    #[error("no language runner registered for '{0}'")]
    UnknownLanguage(String),

    #[error("cannot contact any {service} server")]
    Connection { service: String },

    #[error("delegated transformation {checksum} did not finish within {timeout:?}")]
    DelegationTimeout { checksum: Checksum, timeout: Duration },

    #[error("transformation {0} was hard-cancelled")]
    HardCancelled(Checksum),

    /// Blocking entry point used from inside a running tokio runtime
    #[error("{0} cannot be called from inside a running event loop")]
    InsideRuntime(&'static str),

    #[error("recursive submission of transformation {0}")]
    Recursion(Checksum),

    #[error("service has been shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SeamlessError {
    pub fn codec(celltype: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Codec {
            celltype: celltype.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that a caller may recover from by fingertipping or retrying
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss(_))
    }
}

pub type Result<T> = std::result::Result<T, SeamlessError>;
