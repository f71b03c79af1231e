//! Stash — the in-memory confirmed record store.
//!
//! Records are stored per table, keyed by their encoded key, as full
//! records (key fields merged in). Every mutation appends a diff to the
//! pending buffer; [`Stash::flush`] drains the buffer and notifies
//! subscribers.
//!
//! With [`FlushMode::Runtime`] on a current-thread tokio runtime, the flush
//! is spawned when the first diff of a tick is buffered, so it runs once the
//! writer yields. A multi-threaded runtime would pick that task up while the
//! writer is still mutating, so there the diffs wait for the writer to call
//! [`Stash::end_tick`] (the hydration pipeline does after every step) or
//! [`Stash::flush`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stash_core::{
    codec, DecodeError, EncodedKey, Fields, FlushMode, Operation, RawLogEntry, Registration,
    TableDef, TableId, TableRegistry, Value,
};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, trace, warn};

use crate::error::{StashError, StashResult};
use crate::subscription::{
    deliver, Change, FlushReport, RecordUpdate, Scope, StashUpdate, Subscribers, Subscription,
    TableUpdate,
};
use crate::view::RecordView;

/// Shared, cloneable handle to the record store.
#[derive(Clone)]
pub struct Stash {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    state: Mutex<State>,
    subscribers: Mutex<Subscribers>,
    flush_mode: FlushMode,
}

#[derive(Default)]
struct State {
    registry: TableRegistry,
    records: HashMap<TableId, BTreeMap<EncodedKey, Fields>>,
    pending: Vec<Change>,
    flush_scheduled: bool,
    last_seq: u64,
}

/// Result of applying a batch of operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    pub skipped: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        let removed = lock(&self.subscribers).remove(id);
        if removed {
            debug!(subscriber = id, "unsubscribed");
        }
        removed
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("flush_mode", &self.flush_mode)
            .finish_non_exhaustive()
    }
}

impl Default for Stash {
    fn default() -> Self {
        Self::new(FlushMode::default())
    }
}

impl Stash {
    pub fn new(flush_mode: FlushMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                subscribers: Mutex::new(Subscribers::default()),
                flush_mode,
            }),
        }
    }

    /// A store whose notifications are only delivered by explicit [`flush`](Self::flush) calls.
    pub fn manual() -> Self {
        Self::new(FlushMode::Manual)
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.inner.flush_mode
    }

    /// Sequence number of the most recent record mutation. See [`RecordUpdate::seq`].
    pub fn last_seq(&self) -> u64 {
        self.lock_state().last_seq
    }

    // ── Registry ───────────────────────────────────────────────────

    /// Register a table. A newly accepted table emits a config diff.
    pub fn register_table(&self, table: TableDef) -> StashResult<Registration> {
        let mut state = self.lock_state();
        let id = table.id.clone();
        let registration = state.registry.register(table)?;
        if registration == Registration::Inserted {
            if let Some(current) = state.registry.get(&id).cloned() {
                state.pending.push(Change::Config(TableUpdate {
                    previous: None,
                    current,
                }));
                self.schedule_flush(&mut state);
            }
        }
        Ok(registration)
    }

    pub fn get_table(&self, id: &TableId) -> Option<Arc<TableDef>> {
        self.lock_state().registry.get(id).cloned()
    }

    /// All registered tables, grouped by namespace then name.
    pub fn get_tables(&self) -> BTreeMap<String, BTreeMap<String, Arc<TableDef>>> {
        self.lock_state().registry.by_namespace()
    }

    /// Registry version; bumped on every newly registered table.
    pub fn config_version(&self) -> u64 {
        self.lock_state().registry.version()
    }

    /// Decode a raw entry against the current registry. See [`TableRegistry::decode`].
    pub fn decode(&self, entry: &RawLogEntry) -> Option<Operation> {
        self.lock_state().registry.decode(entry)
    }

    pub fn try_decode(&self, entry: &RawLogEntry) -> Result<Operation, DecodeError> {
        self.lock_state().registry.try_decode(entry)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Current value of a record, key fields included.
    pub fn get_record(&self, table: &TableId, key: &Fields) -> Option<Fields> {
        let state = self.lock_state();
        let def = state.registry.get(table)?;
        let encoded = codec::encode_key(def, key).ok()?;
        state.records.get(table)?.get(&encoded).cloned()
    }

    /// Every record of a table, ordered by encoded key.
    pub fn get_records(&self, table: &TableId) -> Vec<Fields> {
        self.lock_state()
            .records
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_count(&self, table: &TableId) -> usize {
        self.lock_state()
            .records
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Replace the value of a record. `value` must carry every value field.
    pub fn set_record(&self, table: &TableId, key: &Fields, value: &Fields) -> StashResult<()> {
        let mut state = self.lock_state();
        state.set_record(table, key, value)?;
        self.schedule_flush(&mut state);
        Ok(())
    }

    /// Overwrite one value field. A missing record starts from the table's defaults.
    pub fn update_field(
        &self,
        table: &TableId,
        key: &Fields,
        field: &str,
        value: &Value,
    ) -> StashResult<()> {
        let mut state = self.lock_state();
        state.update_field(table, key, field, value)?;
        self.schedule_flush(&mut state);
        Ok(())
    }

    /// Delete a record. Deleting an absent record is a no-op and emits no diff.
    pub fn delete_record(&self, table: &TableId, key: &Fields) -> StashResult<()> {
        let mut state = self.lock_state();
        state.delete_record(table, key)?;
        self.schedule_flush(&mut state);
        Ok(())
    }

    pub fn apply(&self, op: &Operation) -> StashResult<()> {
        let mut state = self.lock_state();
        state.apply(op)?;
        self.schedule_flush(&mut state);
        Ok(())
    }

    /// Apply operations in order under a single lock.
    ///
    /// An operation that fails is logged and skipped; the rest still apply.
    pub fn apply_all(&self, ops: &[Operation]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        if ops.is_empty() {
            return summary;
        }
        let mut state = self.lock_state();
        for op in ops {
            match state.apply(op) {
                Ok(()) => summary.applied += 1,
                Err(e) => {
                    warn!(table = %op.table(), error = %e, "skipping operation");
                    summary.skipped += 1;
                }
            }
        }
        self.schedule_flush(&mut state);
        summary
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Receive every batch of record diffs for one table.
    pub fn subscribe_table(
        &self,
        table: &TableId,
        callback: impl Fn(&[RecordUpdate]) + Send + Sync + 'static,
    ) -> Subscription {
        let id = lock(&self.inner.subscribers).insert(Scope::Table(table.clone(), Arc::new(callback)));
        debug!(subscriber = id, %table, "table subscription added");
        Subscription::new(id, Arc::downgrade(&self.inner))
    }

    /// Receive every batch of record and config diffs for the whole store.
    pub fn subscribe_stash(
        &self,
        callback: impl Fn(&StashUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        let id = lock(&self.inner.subscribers).insert(Scope::Stash(Arc::new(callback)));
        debug!(subscriber = id, "stash subscription added");
        Subscription::new(id, Arc::downgrade(&self.inner))
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Number of diffs buffered since the last flush.
    pub fn pending_changes(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Drain the pending buffer and notify subscribers.
    ///
    /// Each still-subscribed callback receives at most one notification per
    /// kind, holding its diffs in mutation order. Store-scope subscribers
    /// receive config diffs before record diffs. A panicking callback is
    /// logged and does not affect other subscribers.
    pub fn flush(&self) -> FlushReport {
        let changes = {
            let mut state = self.lock_state();
            state.flush_scheduled = false;
            std::mem::take(&mut state.pending)
        };
        let mut report = FlushReport {
            changes: changes.len(),
            ..FlushReport::default()
        };
        if changes.is_empty() {
            return report;
        }

        let mut records = Vec::new();
        let mut configs = Vec::new();
        for change in changes {
            match change {
                Change::Record(update) => records.push(update),
                Change::Config(update) => configs.push(update),
            }
        }

        let subscribers = lock(&self.inner.subscribers).snapshot();
        for (id, scope) in subscribers {
            match scope {
                Scope::Table(table, callback) => {
                    let updates: Vec<RecordUpdate> =
                        records.iter().filter(|u| u.table == table).cloned().collect();
                    if updates.is_empty() || !self.is_subscribed(id) {
                        continue;
                    }
                    report.record(deliver(id, || callback(&updates)));
                }
                Scope::Stash(callback) => {
                    if !configs.is_empty() && self.is_subscribed(id) {
                        let update = StashUpdate::Config(configs.clone());
                        report.record(deliver(id, || callback(&update)));
                    }
                    if !records.is_empty() && self.is_subscribed(id) {
                        let update = StashUpdate::Records(records.clone());
                        report.record(deliver(id, || callback(&update)));
                    }
                }
            }
        }
        trace!(
            changes = report.changes,
            delivered = report.delivered,
            failed = report.failed,
            "flushed"
        );
        report
    }

    /// End a unit of work. In [`FlushMode::Runtime`] the buffered diffs are
    /// delivered now; in manual mode this does nothing.
    pub fn end_tick(&self) -> Option<FlushReport> {
        (self.inner.flush_mode == FlushMode::Runtime).then(|| self.flush())
    }

    fn is_subscribed(&self, id: u64) -> bool {
        lock(&self.inner.subscribers).contains(id)
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn schedule_flush(&self, state: &mut State) {
        if state.pending.is_empty()
            || state.flush_scheduled
            || self.inner.flush_mode == FlushMode::Manual
        {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            trace!("no tokio runtime, diffs stay buffered until flush()");
            return;
        };
        if handle.runtime_flavor() != RuntimeFlavor::CurrentThread {
            trace!("multi-threaded runtime, diffs stay buffered until end_tick()");
            return;
        }
        state.flush_scheduled = true;
        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                Stash { inner }.flush();
            }
        });
    }
}

impl RecordView for Stash {
    fn table(&self, id: &TableId) -> Option<Arc<TableDef>> {
        self.get_table(id)
    }

    fn record(&self, table: &TableId, key: &EncodedKey) -> Option<Fields> {
        self.lock_state().records.get(table)?.get(key).cloned()
    }
}

// ── State mutations (lock held) ────────────────────────────────────

impl State {
    fn table(&self, id: &TableId) -> StashResult<Arc<TableDef>> {
        self.registry
            .get(id)
            .cloned()
            .ok_or_else(|| StashError::UnknownTable(id.clone()))
    }

    fn apply(&mut self, op: &Operation) -> StashResult<()> {
        match op {
            Operation::SetRecord { table, key, value } => self.set_record(table, key, value),
            Operation::SetField {
                table,
                key,
                field,
                value,
            } => self.update_field(table, key, field, value),
            Operation::DeleteRecord { table, key } => self.delete_record(table, key),
        }
    }

    fn set_record(&mut self, id: &TableId, key: &Fields, value: &Fields) -> StashResult<()> {
        let table = self.table(id)?;
        let (key, encoded) = key_of(&table, key)?;
        let mut current = codec::normalize_value(&table, value).map_err(|source| {
            StashError::InvalidValue {
                table: id.clone(),
                source,
            }
        })?;
        current.extend(key.clone());
        let previous = self
            .records
            .entry(id.clone())
            .or_default()
            .insert(encoded.clone(), current.clone());
        debug!(table = %id, key = %encoded, "record set");
        self.push_record(id, key, encoded, previous, Some(current));
        Ok(())
    }

    fn update_field(
        &mut self,
        id: &TableId,
        key: &Fields,
        field: &str,
        value: &Value,
    ) -> StashResult<()> {
        let table = self.table(id)?;
        let (key, encoded) = key_of(&table, key)?;
        codec::check_field(&table, field, value).map_err(|source| StashError::InvalidValue {
            table: id.clone(),
            source,
        })?;
        let rows = self.records.entry(id.clone()).or_default();
        let previous = rows.get(&encoded).cloned();
        let mut current = previous.clone().unwrap_or_else(|| {
            let mut record = codec::default_record(&table);
            record.extend(key.clone());
            record
        });
        current.insert(field.to_string(), value.clone());
        rows.insert(encoded.clone(), current.clone());
        debug!(table = %id, key = %encoded, field, "field updated");
        self.push_record(id, key, encoded, previous, Some(current));
        Ok(())
    }

    fn delete_record(&mut self, id: &TableId, key: &Fields) -> StashResult<()> {
        let table = self.table(id)?;
        let (key, encoded) = key_of(&table, key)?;
        let previous = self.records.get_mut(id).and_then(|rows| rows.remove(&encoded));
        if previous.is_none() {
            debug!(table = %id, key = %encoded, "delete of absent record ignored");
            return Ok(());
        }
        debug!(table = %id, key = %encoded, "record deleted");
        self.push_record(id, key, encoded, previous, None);
        Ok(())
    }

    fn push_record(
        &mut self,
        table: &TableId,
        key: Fields,
        encoded_key: EncodedKey,
        previous: Option<Fields>,
        current: Option<Fields>,
    ) {
        self.last_seq += 1;
        self.pending.push(Change::Record(RecordUpdate {
            seq: self.last_seq,
            table: table.clone(),
            key,
            encoded_key,
            previous,
            current,
        }));
    }
}

fn key_of(table: &TableDef, key: &Fields) -> StashResult<(Fields, EncodedKey)> {
    let invalid = |source| StashError::InvalidKey {
        table: table.id.clone(),
        source,
    };
    let key = codec::extract_key(table, key).map_err(invalid)?;
    let encoded = codec::encode_key(table, &key).map_err(invalid)?;
    Ok((key, encoded))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use stash_core::SchemaError;

    use super::*;

    fn table1() -> TableDef {
        TableDef::from_abi(
            "namespace1",
            "table1",
            &[("field1", "string"), ("field2", "uint32")],
            &["field2"],
        )
        .unwrap()
    }

    fn id1() -> TableId {
        TableId::new("namespace1", "table1")
    }

    fn key(n: u32) -> Fields {
        Fields::from([("field2".to_string(), Value::from(n))])
    }

    fn value(s: &str) -> Fields {
        Fields::from([("field1".to_string(), Value::from(s))])
    }

    fn full(n: u32, s: &str) -> Fields {
        let mut record = value(s);
        record.extend(key(n));
        record
    }

    fn stash() -> Stash {
        let stash = Stash::manual();
        stash.register_table(table1()).unwrap();
        stash.flush();
        stash
    }

    type Seen = Arc<StdMutex<Vec<Vec<RecordUpdate>>>>;

    fn collect(stash: &Stash) -> (Seen, Subscription) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let sub = stash.subscribe_table(&id1(), move |updates| {
            sink.lock().unwrap().push(updates.to_vec());
        });
        (seen, sub)
    }

    #[test]
    fn set_get_delete_record() {
        let stash = stash();
        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        assert_eq!(stash.get_record(&id1(), &key(1)), Some(full(1, "hello")));

        stash.delete_record(&id1(), &key(1)).unwrap();
        assert_eq!(stash.get_record(&id1(), &key(1)), None);
    }

    #[test]
    fn one_tick_delivers_one_notification() {
        let stash = stash();
        let (seen, _sub) = collect(&stash);

        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        stash.delete_record(&id1(), &key(1)).unwrap();
        let report = stash.flush();
        assert_eq!(report.changes, 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[0][0].previous, None);
        assert_eq!(seen[0][0].current, Some(full(1, "hello")));
        assert_eq!(seen[0][1].previous, Some(full(1, "hello")));
        assert_eq!(seen[0][1].current, None);
    }

    #[test]
    fn two_ticks_deliver_two_notifications() {
        let stash = stash();
        let (seen, _sub) = collect(&stash);

        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        stash.flush();
        stash.delete_record(&id1(), &key(1)).unwrap();
        stash.flush();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[1].len(), 1);
        assert_eq!(seen[1][0].current, None);
    }

    #[test]
    fn batch_preserves_mutation_order() {
        let stash = stash();
        let (seen, _sub) = collect(&stash);
        for n in 0..10 {
            stash.set_record(&id1(), &key(n), &value("v")).unwrap();
        }
        stash.flush();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let keys: Vec<_> = seen[0].iter().map(|u| u.key["field2"].as_u64().unwrap()).collect();
        assert_eq!(keys, (0..10u64).collect::<Vec<_>>());
    }

    #[test]
    fn update_field_on_missing_record_uses_defaults() {
        let table = TableDef::from_abi(
            "ns",
            "pos",
            &[("id", "uint8"), ("x", "int32"), ("y", "int32"), ("label", "string")],
            &["id"],
        )
        .unwrap();
        let stash = Stash::manual();
        stash.register_table(table.clone()).unwrap();
        let key = Fields::from([("id".to_string(), Value::from(7u8))]);
        stash.update_field(&table.id, &key, "x", &Value::from(-3i32)).unwrap();

        let record = stash.get_record(&table.id, &key).unwrap();
        assert_eq!(record["x"], Value::Int(-3));
        assert_eq!(record["y"], Value::Int(0));
        assert_eq!(record["label"], Value::from(""));
        assert_eq!(record["id"], Value::from(7u8));
    }

    #[test]
    fn deleting_absent_record_emits_nothing() {
        let stash = stash();
        stash.delete_record(&id1(), &key(9)).unwrap();
        assert_eq!(stash.pending_changes(), 0);
    }

    #[test]
    fn unknown_table_and_bad_values_are_rejected() {
        let stash = stash();
        let err = stash
            .set_record(&TableId::new("ns", "missing"), &key(1), &value("x"))
            .unwrap_err();
        assert!(matches!(err, StashError::UnknownTable(_)));

        let err = stash.set_record(&id1(), &Fields::new(), &value("x")).unwrap_err();
        assert!(matches!(err, StashError::InvalidKey { .. }));

        let bad = Fields::from([("field1".to_string(), Value::from(3u8))]);
        let err = stash.set_record(&id1(), &key(1), &bad).unwrap_err();
        assert!(matches!(err, StashError::InvalidValue { .. }));
        assert_eq!(stash.pending_changes(), 0);
    }

    #[test]
    fn unsubscribe_drops_buffered_diffs() {
        let stash = stash();
        let (seen, sub) = collect(&stash);
        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        stash.flush();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let stash = stash();
        let _bad = stash.subscribe_table(&id1(), |_| panic!("boom"));
        let (seen, _sub) = collect(&stash);

        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        let report = stash.flush();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(stash.get_record(&id1(), &key(1)), Some(full(1, "hello")));
    }

    #[test]
    fn stash_scope_receives_config_then_records() {
        let stash = Stash::manual();
        let seen: Arc<StdMutex<Vec<StashUpdate>>> = Arc::default();
        let sink = seen.clone();
        let _sub = stash.subscribe_stash(move |update| sink.lock().unwrap().push(update.clone()));

        stash.register_table(table1()).unwrap();
        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        stash.register_table(table1()).unwrap();
        stash.flush();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            StashUpdate::Config(updates) => {
                assert_eq!(updates.len(), 1);
                assert!(updates[0].previous.is_none());
                assert_eq!(updates[0].current.id, id1());
            }
            other => panic!("expected config update, got {other:?}"),
        }
        assert!(matches!(&seen[1], StashUpdate::Records(r) if r.len() == 1));
        assert_eq!(stash.config_version(), 1);
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let stash = stash();
        let other = TableDef::from_abi(
            "namespace1",
            "table1",
            &[("field1", "bytes"), ("field2", "uint32")],
            &["field2"],
        )
        .unwrap();
        let err = stash.register_table(other).unwrap_err();
        assert_eq!(err, StashError::Schema(SchemaError::Mismatch { table: id1() }));
        assert_eq!(*stash.get_table(&id1()).unwrap(), table1());
    }

    #[test]
    fn apply_all_skips_failures_and_keeps_order() {
        let stash = stash();
        let ops = vec![
            Operation::SetRecord {
                table: id1(),
                key: key(1),
                value: value("a"),
            },
            Operation::SetRecord {
                table: TableId::new("ns", "missing"),
                key: key(1),
                value: value("a"),
            },
            Operation::SetField {
                table: id1(),
                key: key(1),
                field: "field1".into(),
                value: Value::from("b"),
            },
        ];
        let summary = stash.apply_all(&ops);
        assert_eq!(summary, ApplySummary { applied: 2, skipped: 1 });
        assert_eq!(stash.get_record(&id1(), &key(1)), Some(full(1, "b")));
    }

    #[tokio::test]
    async fn runtime_mode_flushes_once_per_tick() {
        let stash = Stash::new(FlushMode::Runtime);
        stash.register_table(table1()).unwrap();
        let (seen, _sub) = collect(&stash);

        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        stash.set_record(&id1(), &key(2), &value("world")).unwrap();
        assert!(seen.lock().unwrap().is_empty());

        tokio::task::yield_now().await;
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].len(), 2);
        }

        stash.delete_record(&id1(), &key(1)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn multi_thread_runtime_waits_for_end_of_tick() {
        let stash = Stash::new(FlushMode::Runtime);
        stash.register_table(table1()).unwrap();
        stash.end_tick();
        let (seen, _sub) = collect(&stash);

        for round in 0..5u32 {
            for n in 0..2000u32 {
                stash.set_record(&id1(), &key(n), &value(&format!("r{round}"))).unwrap();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            assert_eq!(seen.lock().unwrap().len(), round as usize);

            let report = stash.end_tick().unwrap();
            assert_eq!(report.changes, 2000);
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), round as usize + 1);
            assert_eq!(seen[round as usize].len(), 2000);
        }
    }

    #[test]
    fn end_tick_is_a_no_op_in_manual_mode() {
        let stash = stash();
        stash.set_record(&id1(), &key(1), &value("hello")).unwrap();
        assert!(stash.end_tick().is_none());
        assert_eq!(stash.pending_changes(), 1);
    }

    #[test]
    fn record_updates_carry_increasing_sequence_numbers() {
        let stash = stash();
        let (seen, _sub) = collect(&stash);
        assert_eq!(stash.last_seq(), 0);
        stash.set_record(&id1(), &key(1), &value("a")).unwrap();
        stash.set_record(&id1(), &key(2), &value("b")).unwrap();
        stash.delete_record(&id1(), &key(9)).unwrap();
        stash.delete_record(&id1(), &key(1)).unwrap();
        assert_eq!(stash.last_seq(), 3);
        stash.flush();

        let seqs: Vec<u64> = seen.lock().unwrap()[0].iter().map(|u| u.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    fn ops_for(entries: &[(u32, &str)]) -> Vec<Operation> {
        entries
            .iter()
            .map(|(n, s)| Operation::SetRecord {
                table: id1(),
                key: key(*n),
                value: value(s),
            })
            .collect()
    }

    #[test]
    fn order_across_keys_does_not_change_final_state() {
        let ops = ops_for(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")]);
        let delete_two = Operation::DeleteRecord {
            table: id1(),
            key: key(2),
        };
        let expected = {
            let stash = stash();
            stash.apply_all(&ops);
            stash.get_records(&id1())
        };
        assert_eq!(expected.len(), 4);

        let mut permuted = ops.clone();
        permuted.reverse();
        let mut rotated = ops.clone();
        rotated.rotate_left(2);
        for order in [permuted, rotated] {
            let stash = stash();
            stash.apply_all(&order);
            assert_eq!(stash.get_records(&id1()), expected);
        }

        // a delete on one key commutes with writes on the others
        let mut with_delete = ops.clone();
        with_delete.push(delete_two.clone());
        let mut delete_first = vec![ops[1].clone(), delete_two];
        delete_first.extend([ops[3].clone(), ops[0].clone(), ops[2].clone()]);
        let a = stash();
        a.apply_all(&with_delete);
        let b = stash();
        b.apply_all(&delete_first);
        assert_eq!(a.get_records(&id1()), b.get_records(&id1()));
        assert_eq!(a.record_count(&id1()), 3);
    }

    #[test]
    fn order_within_a_key_decides_final_state() {
        let forward = ops_for(&[(1, "first"), (1, "second")]);
        let mut backward = forward.clone();
        backward.reverse();

        let a = stash();
        a.apply_all(&forward);
        let b = stash();
        b.apply_all(&backward);
        assert_eq!(a.get_record(&id1(), &key(1)), Some(full(1, "second")));
        assert_eq!(b.get_record(&id1(), &key(1)), Some(full(1, "first")));
    }
}
