//! Optimistic action queue.
//!
//! Actions are kept in submission order. Each evaluation pass walks the
//! queue front to back, building the overlay from the confirmed store plus
//! the writes of every earlier active action, so actions touching the same
//! record compose in the order they were submitted.
//!
//! The queue subscribes to the whole store: a confirmed update on a key an
//! active action wrote confirms it, and an update on a key a waiting
//! action read makes it eligible for another evaluation. Only updates
//! made after the action started executing count as its confirmation.
//! Registering a table a waiting action looked for also wakes it.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use stash_core::{Fields, TableId};
use stash_store::{RecordUpdate, RecordView, Stash, StashUpdate, Subscription, TableUpdate};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::action::{
    ActionInfo, ActionRequest, ActionStatus, ErasedAction, ErrorCallback, Prepared, SuccessCallback,
};
use crate::error::ActionError;
use crate::overlay::{overlay, ReadSet, RecordRef, RecordWrite, TrackingView};

/// Queue of optimistic actions over a confirmed store. Cheap to clone.
///
/// Requirement and update functions run while the queue is locked and must
/// not call back into it.
#[derive(Clone)]
pub struct ActionQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    stash: Stash,
    state: Mutex<QueueState>,
    subscription: Mutex<Option<Subscription>>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    entries: Vec<Entry>,
    resolved: HashMap<String, ActionStatus>,
    disposed: bool,
}

struct Entry {
    seq: u64,
    action: ErasedAction,
    status: ActionStatus,
    writes: Vec<RecordWrite>,
    /// Records written by this action.
    touched: BTreeSet<RecordRef>,
    /// What its requirement read on the last evaluation.
    reads: ReadSet,
    /// Store sequence number when execution started.
    since: u64,
    dirty: bool,
    task: Option<AbortHandle>,
    timer: Option<AbortHandle>,
}

impl Entry {
    fn info(&self) -> ActionInfo {
        ActionInfo {
            id: self.action.id.clone(),
            entity: self.action.entity.clone(),
            status: self.status,
            metadata: self.action.metadata.clone(),
        }
    }
}

/// A resolved action whose callback has yet to fire.
struct Resolved {
    id: String,
    outcome: Result<(), ActionError>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl Resolved {
    fn fire(self) {
        let Resolved {
            id,
            outcome,
            on_success,
            on_error,
        } = self;
        let result = panic::catch_unwind(AssertUnwindSafe(|| match &outcome {
            Ok(()) => {
                if let Some(f) = on_success {
                    f();
                }
            }
            Err(e) => {
                if let Some(f) = on_error {
                    f(e);
                }
            }
        }));
        if result.is_err() {
            warn!(action = %id, "action callback panicked");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ActionQueue {
    /// Create a queue reading from `stash` and subscribe it to confirmed updates.
    pub fn new(stash: Stash) -> Self {
        let inner = Arc::new(QueueInner {
            stash: stash.clone(),
            state: Mutex::new(QueueState::default()),
            subscription: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let subscription = stash.subscribe_stash(move |update| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match update {
                StashUpdate::Records(updates) => ActionQueue { inner }.on_records(updates),
                StashUpdate::Config(updates) => ActionQueue { inner }.on_config(updates),
            }
        });
        *lock(&inner.subscription) = Some(subscription);
        Self { inner }
    }

    pub fn stash(&self) -> &Stash {
        &self.inner.stash
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Queue an action and evaluate its requirement right away.
    ///
    /// Fails if the queue was disposed or an unresolved action with the
    /// same id is already queued.
    pub fn enqueue<T: Send + 'static>(&self, request: ActionRequest<T>) -> Result<(), ActionError> {
        {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(ActionError::Disposed);
            }
            if state.entries.iter().any(|e| e.action.id == request.id()) {
                return Err(ActionError::DuplicateId(request.id().to_string()));
            }
            let action = request.into_erased();
            state.resolved.remove(&action.id);
            state.next_seq += 1;
            let seq = state.next_seq;
            debug!(action = %action.id, seq, "action queued");
            state.entries.push(Entry {
                seq,
                action,
                status: ActionStatus::Waiting,
                writes: Vec::new(),
                touched: BTreeSet::new(),
                reads: ReadSet::default(),
                since: 0,
                dirty: true,
                task: None,
                timer: None,
            });
        }
        self.settle(Vec::new());
        Ok(())
    }

    /// Drop a waiting action. Its error callback receives [`ActionError::Cancelled`].
    ///
    /// Returns `false` if no waiting action has this id.
    pub fn cancel(&self, id: &str) -> bool {
        let resolved = {
            let mut state = self.lock_state();
            let Some(index) = state
                .entries
                .iter()
                .position(|e| e.action.id == id && e.status == ActionStatus::Waiting)
            else {
                return false;
            };
            state.resolve(index, Err(ActionError::Cancelled))
        };
        self.settle(vec![resolved]);
        true
    }

    /// Unsubscribe from the store and fail every unresolved action with
    /// [`ActionError::Disposed`]. Later submissions are refused.
    pub fn dispose(&self) {
        if let Some(subscription) = lock(&self.inner.subscription).take() {
            subscription.unsubscribe();
        }
        let resolved: Vec<Resolved> = {
            let mut state = self.lock_state();
            state.disposed = true;
            let mut resolved = Vec::new();
            while !state.entries.is_empty() {
                resolved.push(state.resolve(0, Err(ActionError::Disposed)));
            }
            resolved
        };
        info!(resolved = resolved.len(), "action queue disposed");
        for r in resolved {
            r.fire();
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// A record as seen through every active action's writes.
    pub fn optimistic_record(&self, table: &TableId, key: &Fields) -> Option<Fields> {
        self.with_optimistic(|view| view.get(table, key))
    }

    /// Run `f` against the current optimistic view. The queue stays locked
    /// while `f` runs.
    pub fn with_optimistic<R>(&self, f: impl FnOnce(&dyn RecordView) -> R) -> R {
        let state = self.lock_state();
        let view = overlay(&self.inner.stash, state.active_writes());
        f(&view)
    }

    /// Status of the most recent action with this id.
    pub fn status(&self, id: &str) -> Option<ActionStatus> {
        let state = self.lock_state();
        state
            .entries
            .iter()
            .find(|e| e.action.id == id)
            .map(|e| e.status)
            .or_else(|| state.resolved.get(id).copied())
    }

    /// Unresolved actions in submission order.
    pub fn pending(&self) -> Vec<ActionInfo> {
        self.lock_state().entries.iter().map(Entry::info).collect()
    }

    // ── Resolution ─────────────────────────────────────────────────

    fn on_records(&self, updates: &[RecordUpdate]) {
        let sequenced: Vec<(u64, RecordRef)> = updates
            .iter()
            .map(|u| (u.seq, (u.table.clone(), u.encoded_key.clone())))
            .collect();
        let changed: BTreeSet<RecordRef> = sequenced.iter().map(|(_, r)| r.clone()).collect();
        let resolved = {
            let mut state = self.lock_state();
            let mut resolved = Vec::new();
            let mut index = 0;
            while index < state.entries.len() {
                let entry = &state.entries[index];
                let confirmed = entry.status.is_active()
                    && sequenced
                        .iter()
                        .any(|(seq, r)| *seq > entry.since && entry.touched.contains(r));
                if confirmed {
                    resolved.push(state.resolve(index, Ok(())));
                } else {
                    index += 1;
                }
            }
            state.mark_readers(&changed);
            resolved
        };
        self.settle(resolved);
    }

    fn on_config(&self, updates: &[TableUpdate]) {
        {
            let mut state = self.lock_state();
            for entry in &mut state.entries {
                if entry.status == ActionStatus::Waiting
                    && updates
                        .iter()
                        .any(|u| entry.reads.missing_tables.contains(&u.current.id))
                {
                    entry.dirty = true;
                }
            }
        }
        self.settle(Vec::new());
    }

    fn executed(&self, seq: u64, result: Result<(), ActionError>) {
        let resolved = {
            let mut state = self.lock_state();
            let Some(index) = state.entries.iter().position(|e| e.seq == seq) else {
                debug!(seq, "execute finished for an already resolved action");
                return;
            };
            let entry = &mut state.entries[index];
            entry.task = None;
            match result {
                Ok(()) if entry.action.may_not_write => state.resolve(index, Ok(())),
                Ok(()) => {
                    debug!(action = %entry.action.id, "action executed, awaiting confirmation");
                    entry.status = ActionStatus::Pending;
                    return;
                }
                Err(e) => state.resolve(index, Err(e)),
            }
        };
        self.settle(vec![resolved]);
    }

    fn timed_out(&self, seq: u64, after: Duration) {
        let resolved = {
            let mut state = self.lock_state();
            let Some(index) = state
                .entries
                .iter()
                .position(|e| e.seq == seq && e.status.is_active())
            else {
                return;
            };
            state.resolve(index, Err(ActionError::Timeout(after)))
        };
        self.settle(vec![resolved]);
    }

    /// Fire callbacks, then re-evaluate until no further action resolves.
    fn settle(&self, mut resolved: Vec<Resolved>) {
        loop {
            for r in resolved.drain(..) {
                r.fire();
            }
            let weak = Arc::downgrade(&self.inner);
            resolved = self.lock_state().evaluate(&self.inner.stash, &weak);
            if resolved.is_empty() {
                break;
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.inner.state)
    }
}

// ── Queue state (lock held) ────────────────────────────────────────

impl QueueState {
    fn active_writes(&self) -> impl Iterator<Item = &RecordWrite> {
        self.entries
            .iter()
            .filter(|e| e.status.is_active())
            .flat_map(|e| e.writes.iter())
    }

    /// Flag waiting actions that read any of `changed`.
    fn mark_readers(&mut self, changed: &BTreeSet<RecordRef>) {
        for entry in &mut self.entries {
            if entry.status == ActionStatus::Waiting && !entry.reads.records.is_disjoint(changed) {
                entry.dirty = true;
            }
        }
    }

    /// One pass over the queue in submission order. Returns the actions
    /// that failed to start.
    fn evaluate(&mut self, stash: &Stash, queue: &Weak<QueueInner>) -> Vec<Resolved> {
        let mut resolved = Vec::new();
        let mut earlier: Vec<RecordWrite> = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &mut self.entries[index];
            if entry.status.is_active() {
                earlier.extend(entry.writes.iter().cloned());
                index += 1;
                continue;
            }
            if !entry.dirty {
                index += 1;
                continue;
            }
            entry.dirty = false;

            let view = overlay(stash, &earlier);
            let tracking = TrackingView::new(&view);
            let prepared = (entry.action.prepare)(&tracking);
            entry.reads = tracking.into_reads();
            let Some(Prepared { writes, run }) = prepared else {
                index += 1;
                continue;
            };

            let touched = match touched_records(stash, &writes) {
                Ok(touched) => touched,
                Err(e) => {
                    resolved.push(self.resolve(index, Err(e)));
                    continue;
                }
            };
            let Ok(handle) = Handle::try_current() else {
                resolved.push(self.resolve(index, Err(ActionError::NoRuntime)));
                continue;
            };

            let entry = &mut self.entries[index];
            let seq = entry.seq;
            let task = {
                let queue = queue.clone();
                handle.spawn(async move {
                    let result = AssertUnwindSafe(run)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(ActionError::execution("execute panicked")));
                    if let Some(inner) = queue.upgrade() {
                        ActionQueue { inner }.executed(seq, result);
                    }
                })
            };
            entry.task = Some(task.abort_handle());
            if let Some(after) = entry.action.timeout {
                let queue = queue.clone();
                let timer = handle.spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(inner) = queue.upgrade() {
                        ActionQueue { inner }.timed_out(seq, after);
                    }
                });
                entry.timer = Some(timer.abort_handle());
            }
            info!(action = %entry.action.id, writes = writes.len(), "action executing");
            entry.status = ActionStatus::Executing;
            entry.since = stash.last_seq();
            earlier.extend(writes.iter().cloned());
            entry.writes = writes;
            entry.touched = touched.clone();
            self.mark_later_readers(index, &touched);
            index += 1;
        }
        resolved
    }

    /// Flag waiting actions after `index` that read any of `changed`.
    fn mark_later_readers(&mut self, index: usize, changed: &BTreeSet<RecordRef>) {
        for entry in self.entries.iter_mut().skip(index + 1) {
            if entry.status == ActionStatus::Waiting && !entry.reads.records.is_disjoint(changed) {
                entry.dirty = true;
            }
        }
    }

    /// Remove the entry at `index` and record its final status. Its writes
    /// leave the overlay, so waiting actions that read them are flagged.
    fn resolve(&mut self, index: usize, outcome: Result<(), ActionError>) -> Resolved {
        let mut entry = self.entries.remove(index);
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        let status = match &outcome {
            Ok(()) => ActionStatus::Confirmed,
            Err(e) => {
                if let Some(task) = entry.task.take() {
                    task.abort();
                }
                warn!(action = %entry.action.id, error = %e, "action failed");
                ActionStatus::Failed
            }
        };
        if status == ActionStatus::Confirmed {
            info!(action = %entry.action.id, "action confirmed");
        }
        self.resolved.insert(entry.action.id.clone(), status);
        self.mark_readers(&entry.touched);
        Resolved {
            id: entry.action.id,
            outcome,
            on_success: entry.action.on_success.take(),
            on_error: entry.action.on_error.take(),
        }
    }
}

fn touched_records(stash: &Stash, writes: &[RecordWrite]) -> Result<BTreeSet<RecordRef>, ActionError> {
    writes
        .iter()
        .map(|write| {
            let table = stash
                .get_table(write.table())
                .ok_or_else(|| ActionError::InvalidWrite(format!("unknown table {}", write.table())))?;
            let key = write
                .encoded_key(&table)
                .map_err(|e| ActionError::InvalidWrite(format!("{}: {e}", table.id)))?;
            Ok((table.id.clone(), key))
        })
        .collect()
}
