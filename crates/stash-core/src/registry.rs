//! Table registry — maps table ids to schemas and decodes raw log entries.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec;
use crate::error::{DecodeError, SchemaError};
use crate::operation::{Operation, RawEvent, RawLogEntry};
use crate::table::{TableDef, TableId};

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The table was new; the registry version was bumped.
    Inserted,
    /// An identical definition was already registered.
    Unchanged,
}

/// Versioned set of registered tables.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<TableId, Arc<TableDef>>,
    version: u64,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table, or confirm an identical registration.
    ///
    /// A different schema under an existing id is rejected with
    /// [`SchemaError::Mismatch`] and the existing entry is left untouched.
    pub fn register(&mut self, table: TableDef) -> Result<Registration, SchemaError> {
        table.validate()?;
        if let Some(existing) = self.tables.get(&table.id) {
            if **existing == table {
                return Ok(Registration::Unchanged);
            }
            warn!(table = %table.id, "rejecting conflicting table registration");
            return Err(SchemaError::Mismatch { table: table.id });
        }
        debug!(table = %table.id, fields = table.schema.len(), "table registered");
        self.tables.insert(table.id.clone(), Arc::new(table));
        self.version += 1;
        Ok(Registration::Inserted)
    }

    pub fn get(&self, id: &TableId) -> Option<&Arc<TableDef>> {
        self.tables.get(id)
    }

    pub fn contains(&self, id: &TableId) -> bool {
        self.tables.contains_key(id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableDef>> {
        self.tables.values()
    }

    /// Tables grouped as namespace → name → definition.
    pub fn by_namespace(&self) -> BTreeMap<String, BTreeMap<String, Arc<TableDef>>> {
        let mut grouped: BTreeMap<String, BTreeMap<String, Arc<TableDef>>> = BTreeMap::new();
        for (id, table) in &self.tables {
            grouped
                .entry(id.namespace.clone())
                .or_default()
                .insert(id.name.clone(), Arc::clone(table));
        }
        grouped
    }

    /// Incremented on every accepted new registration.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Decode a raw record event into a typed operation.
    pub fn try_decode(&self, entry: &RawLogEntry) -> Result<Operation, DecodeError> {
        let table = self
            .tables
            .get(&entry.table)
            .ok_or_else(|| DecodeError::UnknownTable(entry.table.clone()))?;
        let malformed = |source| DecodeError::Malformed {
            table: entry.table.clone(),
            source,
        };
        let key = codec::decode_key(table, &entry.key).map_err(malformed)?;

        match &entry.event {
            RawEvent::SetRecord { data } => Ok(Operation::SetRecord {
                table: entry.table.clone(),
                key,
                value: codec::decode_record(table, data).map_err(malformed)?,
            }),
            RawEvent::SetField { field, data } => Ok(Operation::SetField {
                table: entry.table.clone(),
                key,
                field: field.clone(),
                value: codec::decode_field(table, field, data).map_err(malformed)?,
            }),
            RawEvent::DeleteRecord => Ok(Operation::DeleteRecord {
                table: entry.table.clone(),
                key,
            }),
            RawEvent::RegisterTable { .. } => Err(DecodeError::NotRecordEvent(entry.table.clone())),
        }
    }

    /// Decode a raw entry, logging and returning `None` if it cannot be applied.
    ///
    /// Entries for unregistered tables are expected while tables are still
    /// being registered, so they only log at debug level.
    pub fn decode(&self, entry: &RawLogEntry) -> Option<Operation> {
        match self.try_decode(entry) {
            Ok(op) => Some(op),
            Err(DecodeError::UnknownTable(table)) => {
                debug!(%table, block = entry.block_number, "skipping entry for unknown table");
                None
            }
            Err(e) => {
                warn!(block = entry.block_number, error = %e, "skipping undecodable entry");
                None
            }
        }
    }
}
