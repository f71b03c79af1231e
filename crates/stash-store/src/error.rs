//! Error types for the record store.

use stash_core::{CodecError, SchemaError, TableId};
use thiserror::Error;

/// Result type alias for record store operations.
pub type StashResult<T> = Result<T, StashError>;

/// Errors that can occur while mutating the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StashError {
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    #[error("invalid key for table {table}: {source}")]
    InvalidKey {
        table: TableId,
        #[source]
        source: CodecError,
    },

    #[error("invalid value for table {table}: {source}")]
    InvalidValue {
        table: TableId,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// A subscriber callback panicked during delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subscriber {subscriber} failed: {message}")]
pub struct SubscriberError {
    pub subscriber: u64,
    pub message: String,
}
