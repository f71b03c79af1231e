//! stash-core — shared types for the stash table mirror.
//!
//! Defines how ledger tables are described and encoded:
//!
//! - [`TableId`] / [`TableDef`]: stable table identity and its schema
//! - [`PrimitiveKind`] / [`Value`]: the closed set of field kinds
//! - [`codec`]: fixed-width key encoding and record data encoding
//! - [`TableRegistry`]: schema registration and raw log decoding
//! - [`config`]: `stash.toml` parsing and the config stage pipeline
//!
//! Every other stash crate builds on these types; none of them know
//! about the transport that produced a log entry.

pub mod codec;
pub mod config;
pub mod error;
pub mod kind;
pub mod operation;
pub mod registry;
pub mod table;

pub use codec::EncodedKey;
pub use config::{
    ConfigPipeline, ConfigStage, FlushMode, MergeTables, ResolvedConfig, StashConfig, StoreConfig,
};
pub use error::{CodecError, ConfigError, DecodeError, SchemaError};
pub use kind::{PrimitiveKind, Value};
pub use operation::{Fields, Operation, RawEvent, RawLogEntry};
pub use registry::{Registration, TableRegistry};
pub use table::{FieldSpec, TableDef, TableId};
