//! Subscriber registry and change notification types.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use stash_core::{EncodedKey, Fields, TableDef, TableId};
use tracing::warn;

use crate::error::SubscriberError;
use crate::store::Inner;

/// One record diff. `previous`/`current` are full records with key fields merged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    /// Store-wide sequence number of this mutation, strictly increasing.
    pub seq: u64,
    pub table: TableId,
    pub key: Fields,
    pub encoded_key: EncodedKey,
    pub previous: Option<Fields>,
    pub current: Option<Fields>,
}

/// A registry change. `previous` is `None` for a newly registered table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUpdate {
    pub previous: Option<Arc<TableDef>>,
    pub current: Arc<TableDef>,
}

/// Notification delivered to store-scope subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StashUpdate {
    Records(Vec<RecordUpdate>),
    Config(Vec<TableUpdate>),
}

/// A buffered diff, in mutation order.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    Record(RecordUpdate),
    Config(TableUpdate),
}

pub(crate) type TableCallback = Arc<dyn Fn(&[RecordUpdate]) + Send + Sync>;
pub(crate) type StashCallback = Arc<dyn Fn(&StashUpdate) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Scope {
    Table(TableId, TableCallback),
    Stash(StashCallback),
}

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: u64,
    entries: BTreeMap<u64, Scope>,
}

impl Subscribers {
    pub(crate) fn insert(&mut self, scope: Scope) -> u64 {
        self.next_id += 1;
        self.entries.insert(self.next_id, scope);
        self.next_id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot of the current subscribers, so callbacks can run unlocked.
    pub(crate) fn snapshot(&self) -> Vec<(u64, Scope)> {
        self.entries
            .iter()
            .map(|(id, scope)| (*id, scope.clone()))
            .collect()
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle leaves the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to stop delivery.
#[must_use = "the callback stays registered until unsubscribe() is called"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub(crate) fn new(id: u64, inner: Weak<Inner>) -> Self {
        Self { id, inner }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery immediately, including of diffs already buffered.
    ///
    /// Returns `false` if the subscription was already removed.
    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.unsubscribe(self.id),
            None => false,
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Buffered diffs drained by this flush.
    pub changes: usize,
    /// Notifications delivered without fault.
    pub delivered: usize,
    /// Notifications whose callback panicked.
    pub failed: usize,
}

impl FlushReport {
    pub(crate) fn record(&mut self, outcome: Result<(), SubscriberError>) {
        match outcome {
            Ok(()) => self.delivered += 1,
            Err(e) => {
                warn!(subscriber = e.subscriber, error = %e, "subscriber callback failed");
                self.failed += 1;
            }
        }
    }
}

/// Run a callback, converting a panic into a [`SubscriberError`].
pub(crate) fn deliver(subscriber: u64, f: impl FnOnce()) -> Result<(), SubscriberError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked".to_string()
        };
        SubscriberError {
            subscriber,
            message,
        }
    })
}
