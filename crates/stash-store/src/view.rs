//! Read-only record access shared by the confirmed store and overlays.

use std::sync::Arc;

use stash_core::{codec, EncodedKey, Fields, TableDef, TableId};

/// A readable set of tables and records.
pub trait RecordView {
    fn table(&self, id: &TableId) -> Option<Arc<TableDef>>;

    /// The record stored under an encoded key, key fields included.
    fn record(&self, table: &TableId, key: &EncodedKey) -> Option<Fields>;

    /// Look a record up by its key fields.
    fn get(&self, table: &TableId, key: &Fields) -> Option<Fields> {
        let def = self.table(table)?;
        let encoded = codec::encode_key(&def, key).ok()?;
        self.record(table, &encoded)
    }
}

impl<V: RecordView + ?Sized> RecordView for &V {
    fn table(&self, id: &TableId) -> Option<Arc<TableDef>> {
        (**self).table(id)
    }

    fn record(&self, table: &TableId, key: &EncodedKey) -> Option<Fields> {
        (**self).record(table, key)
    }
}
