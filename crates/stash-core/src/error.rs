//! Error types for table definitions, the record codec, and config loading.

use thiserror::Error;

use crate::table::TableId;

/// Errors raised while validating or registering a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid primitive kind: {0:?}")]
    InvalidKind(String),

    #[error("namespace {0:?} is longer than 14 bytes")]
    NamespaceTooLong(String),

    #[error("table name {0:?} is longer than 16 bytes")]
    NameTooLong(String),

    #[error("table {table} has no fields")]
    NoFields { table: TableId },

    #[error("table {table} declares field {field:?} more than once")]
    DuplicateField { table: TableId, field: String },

    #[error("table {table} key field {field:?} is not part of the schema")]
    UnknownKeyField { table: TableId, field: String },

    #[error("table {table} key field {field:?} has dynamic kind {kind}")]
    DynamicKeyField {
        table: TableId,
        field: String,
        kind: String,
    },

    /// A table id is already registered with a structurally different schema.
    #[error("table {table} is already registered with a different schema")]
    Mismatch { table: TableId },
}

/// Errors raised while encoding or decoding keys and record data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("missing field {0:?}")]
    MissingField(String),

    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("field {field:?} is a key field and cannot be set on its own")]
    KeyField { field: String },

    #[error("value for field {field:?} does not fit kind {kind}")]
    KindMismatch { field: String, kind: String },

    #[error("expected {expected} bytes, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("data truncated while reading field {0:?}")]
    Truncated(String),

    #[error("field {0:?} is not valid utf-8")]
    InvalidUtf8(String),

    #[error("{0} trailing bytes after last field")]
    TrailingBytes(usize),
}

/// Errors raised while turning a raw log entry into an operation.
///
/// These are never fatal: the registry logs them and skips the entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    #[error("malformed entry for table {table}: {source}")]
    Malformed {
        table: TableId,
        #[source]
        source: CodecError,
    },

    #[error("entry for table {0} does not carry a record event")]
    NotRecordEvent(TableId),
}

/// Errors raised while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid table config: {0}")]
    Schema(#[from] SchemaError),

    #[error("config stage {stage:?} failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("config stage {stage:?} produced an invalid config: {source}")]
    StageOutput {
        stage: String,
        #[source]
        source: SchemaError,
    },
}
