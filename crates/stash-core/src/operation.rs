//! Typed table operations and the raw log entries they are decoded from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::CodecError;
use crate::kind::Value;
use crate::table::{TableDef, TableId};

/// Field name → value, ordered by field name.
pub type Fields = BTreeMap<String, Value>;

/// The unit of applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Replace the full value of a record.
    SetRecord {
        table: TableId,
        key: Fields,
        value: Fields,
    },
    /// Overwrite one value field, creating the record from defaults if absent.
    SetField {
        table: TableId,
        key: Fields,
        field: String,
        value: Value,
    },
    DeleteRecord { table: TableId, key: Fields },
}

impl Operation {
    pub fn table(&self) -> &TableId {
        match self {
            Operation::SetRecord { table, .. }
            | Operation::SetField { table, .. }
            | Operation::DeleteRecord { table, .. } => table,
        }
    }

    pub fn key(&self) -> &Fields {
        match self {
            Operation::SetRecord { key, .. }
            | Operation::SetField { key, .. }
            | Operation::DeleteRecord { key, .. } => key,
        }
    }
}

/// A state-change log entry as delivered by the remote log source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLogEntry {
    pub block_number: u64,
    #[serde(default)]
    pub log_index: u32,
    pub table: TableId,
    /// Encoded key; empty for registrations and singleton tables.
    #[serde(default, with = "hex::serde")]
    pub key: Vec<u8>,
    pub event: RawEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RawEvent {
    SetRecord {
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },
    SetField {
        field: String,
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },
    DeleteRecord,
    /// A table registration observed on the ledger.
    RegisterTable { table: TableDef },
}

impl RawLogEntry {
    pub fn set_record(
        block_number: u64,
        table: &TableDef,
        key: &Fields,
        value: &Fields,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            block_number,
            log_index: 0,
            table: table.id.clone(),
            key: codec::encode_key(table, key)?.as_bytes().to_vec(),
            event: RawEvent::SetRecord {
                data: codec::encode_record(table, value)?,
            },
        })
    }

    pub fn set_field(
        block_number: u64,
        table: &TableDef,
        key: &Fields,
        field: &str,
        value: &Value,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            block_number,
            log_index: 0,
            table: table.id.clone(),
            key: codec::encode_key(table, key)?.as_bytes().to_vec(),
            event: RawEvent::SetField {
                field: field.to_string(),
                data: codec::encode_field(table, field, value)?,
            },
        })
    }

    pub fn delete_record(block_number: u64, table: &TableDef, key: &Fields) -> Result<Self, CodecError> {
        Ok(Self {
            block_number,
            log_index: 0,
            table: table.id.clone(),
            key: codec::encode_key(table, key)?.as_bytes().to_vec(),
            event: RawEvent::DeleteRecord,
        })
    }

    pub fn register_table(block_number: u64, table: TableDef) -> Self {
        Self {
            block_number,
            log_index: 0,
            table: table.id.clone(),
            key: Vec::new(),
            event: RawEvent::RegisterTable { table },
        }
    }

    /// Set the position of this entry within its block.
    pub fn at_index(mut self, log_index: u32) -> Self {
        self.log_index = log_index;
        self
    }
}
