//! Layered reads: pending writes over a confirmed view.
//!
//! [`overlay`] folds an ordered list of writes over a base view and answers
//! reads from the folded layer first. It never mutates the base.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use stash_core::{codec, CodecError, EncodedKey, Fields, TableDef, TableId};
use stash_store::RecordView;
use tracing::warn;

/// Identity of one record: table plus encoded key.
pub type RecordRef = (TableId, EncodedKey);

/// A speculative write produced by an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordWrite {
    /// Replace the whole record.
    Set {
        table: TableId,
        key: Fields,
        value: Fields,
    },
    /// Overwrite some value fields, starting from defaults when absent.
    Update {
        table: TableId,
        key: Fields,
        fields: Fields,
    },
    Delete { table: TableId, key: Fields },
}

impl RecordWrite {
    pub fn set(table: &TableId, key: Fields, value: Fields) -> Self {
        RecordWrite::Set {
            table: table.clone(),
            key,
            value,
        }
    }

    pub fn update(table: &TableId, key: Fields, fields: Fields) -> Self {
        RecordWrite::Update {
            table: table.clone(),
            key,
            fields,
        }
    }

    pub fn delete(table: &TableId, key: Fields) -> Self {
        RecordWrite::Delete {
            table: table.clone(),
            key,
        }
    }

    pub fn table(&self) -> &TableId {
        match self {
            RecordWrite::Set { table, .. }
            | RecordWrite::Update { table, .. }
            | RecordWrite::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &Fields {
        match self {
            RecordWrite::Set { key, .. }
            | RecordWrite::Update { key, .. }
            | RecordWrite::Delete { key, .. } => key,
        }
    }

    /// Encoded key of the record this write targets.
    pub fn encoded_key(&self, table: &TableDef) -> Result<EncodedKey, CodecError> {
        codec::encode_key(table, self.key())
    }

    /// The record after this write, given the record before it.
    pub fn apply_to(&self, table: &TableDef, current: Option<Fields>) -> Result<Option<Fields>, CodecError> {
        let key = codec::extract_key(table, self.key())?;
        match self {
            RecordWrite::Set { value, .. } => {
                let mut record = codec::normalize_value(table, value)?;
                record.extend(key);
                Ok(Some(record))
            }
            RecordWrite::Update { fields, .. } => {
                let mut record = current.unwrap_or_else(|| {
                    let mut record = codec::default_record(table);
                    record.extend(key.clone());
                    record
                });
                for (field, value) in fields {
                    if table.is_key(field) {
                        continue;
                    }
                    codec::check_field(table, field, value)?;
                    record.insert(field.clone(), value.clone());
                }
                Ok(Some(record))
            }
            RecordWrite::Delete { .. } => Ok(None),
        }
    }
}

/// A read view with pending writes layered over a base view.
pub struct OverlayView<V> {
    base: V,
    layer: HashMap<RecordRef, Option<Fields>>,
}

/// Fold `writes`, in order, over `base`.
///
/// Writes against unknown tables or with invalid keys or values are
/// skipped with a warning.
pub fn overlay<'w, V: RecordView>(
    base: V,
    writes: impl IntoIterator<Item = &'w RecordWrite>,
) -> OverlayView<V> {
    let mut layer: HashMap<RecordRef, Option<Fields>> = HashMap::new();
    for write in writes {
        let Some(table) = base.table(write.table()) else {
            warn!(table = %write.table(), "overlay write for unknown table skipped");
            continue;
        };
        let encoded = match write.encoded_key(&table) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(table = %table.id, error = %e, "overlay write with invalid key skipped");
                continue;
            }
        };
        let slot = (table.id.clone(), encoded);
        let current = match layer.get(&slot) {
            Some(value) => value.clone(),
            None => base.record(&slot.0, &slot.1),
        };
        match write.apply_to(&table, current) {
            Ok(next) => {
                layer.insert(slot, next);
            }
            Err(e) => warn!(table = %table.id, error = %e, "overlay write with invalid value skipped"),
        }
    }
    OverlayView { base, layer }
}

impl<V: RecordView> OverlayView<V> {
    /// Records whose value differs from the base because of the layered writes.
    pub fn touched(&self) -> impl Iterator<Item = &RecordRef> {
        self.layer.keys()
    }

    pub fn base(&self) -> &V {
        &self.base
    }
}

impl<V: RecordView> RecordView for OverlayView<V> {
    fn table(&self, id: &TableId) -> Option<Arc<TableDef>> {
        self.base.table(id)
    }

    fn record(&self, table: &TableId, key: &EncodedKey) -> Option<Fields> {
        match self.layer.get(&(table.clone(), key.clone())) {
            Some(value) => value.clone(),
            None => self.base.record(table, key),
        }
    }
}

/// What a requirement looked at: records it read, and tables it asked for
/// that were not registered yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSet {
    pub records: BTreeSet<RecordRef>,
    pub missing_tables: BTreeSet<TableId>,
}

/// Wraps a view and remembers every record and missing table read through it.
pub struct TrackingView<'a> {
    inner: &'a dyn RecordView,
    reads: RefCell<ReadSet>,
}

impl<'a> TrackingView<'a> {
    pub fn new(inner: &'a dyn RecordView) -> Self {
        Self {
            inner,
            reads: RefCell::default(),
        }
    }

    pub fn into_reads(self) -> ReadSet {
        self.reads.into_inner()
    }
}

impl RecordView for TrackingView<'_> {
    fn table(&self, id: &TableId) -> Option<Arc<TableDef>> {
        let table = self.inner.table(id);
        if table.is_none() {
            self.reads.borrow_mut().missing_tables.insert(id.clone());
        }
        table
    }

    fn record(&self, table: &TableId, key: &EncodedKey) -> Option<Fields> {
        self.reads.borrow_mut().records.insert((table.clone(), key.clone()));
        self.inner.record(table, key)
    }
}
