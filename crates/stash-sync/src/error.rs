//! Error types for log fetching and the hydration pipeline.

use stash_core::SchemaError;
use stash_store::StashError;
use thiserror::Error;

use crate::source::BlockRange;

/// A failed request to a log or snapshot source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("source closed")]
    Closed,
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Timeout)
    }
}

/// A failure that halts the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("{what} failed after {attempts} attempts: {source}")]
    FetchExhausted {
        what: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("invalid source range {0}")]
    InvalidRange(BlockRange),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("store error: {0}")]
    Store(#[from] StashError),

    #[error("live subscription closed by source")]
    LiveClosed,

    #[error("sync task aborted: {0}")]
    Aborted(String),
}
