//! In-process log source backed by a vector of entries.
//!
//! Used by tests and by the CLI's fixture replay. Supports injected
//! failures, per-range fetch latency, and live announcements.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use stash_core::{RawLogEntry, TableId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::FetchError;
use crate::source::{BlockRange, LiveBatch, LogSource};

type LatencyFn = Arc<dyn Fn(BlockRange) -> Duration + Send + Sync>;

#[derive(Clone, Default)]
pub struct MemoryLogSource {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    logs: Vec<RawLogEntry>,
    head: u64,
    failures: VecDeque<FetchError>,
    fetched: Vec<BlockRange>,
    latency: Option<LatencyFn>,
    subscribers: Vec<mpsc::UnboundedSender<LiveBatch>>,
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source holding `logs`, with the head at the highest block among them.
    pub fn with_logs(logs: Vec<RawLogEntry>) -> Self {
        let source = Self::new();
        {
            let mut state = source.lock();
            state.head = logs.iter().map(|e| e.block_number).max().unwrap_or(0);
            state.logs = logs;
        }
        source
    }

    pub fn set_head(&self, head: u64) {
        self.lock().head = head;
    }

    /// Append entries without announcing them.
    pub fn extend(&self, logs: impl IntoIterator<Item = RawLogEntry>) {
        let mut state = self.lock();
        state.logs.extend(logs);
        let max = state.logs.iter().map(|e| e.block_number).max().unwrap_or(0);
        state.head = state.head.max(max);
    }

    /// Append the entries of a new range, advance the head, and announce it live.
    pub fn publish(&self, range: BlockRange, logs: Vec<RawLogEntry>) {
        let mut state = self.lock();
        state.logs.extend(logs.iter().cloned());
        state.head = state.head.max(range.to);
        broadcast(&mut state, LiveBatch { range, logs });
    }

    /// Announce a range live using the entries already stored for it.
    pub fn announce(&self, range: BlockRange) {
        let mut state = self.lock();
        let logs = select(&state.logs, range, &[]);
        broadcast(&mut state, LiveBatch { range, logs });
    }

    /// Close every live subscription.
    pub fn close_live(&self) {
        self.lock().subscribers.clear();
    }

    /// Make the next `n` requests fail with `error`.
    pub fn fail_next(&self, n: usize, error: FetchError) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat_n(error, n));
    }

    /// Delay each range fetch by `latency(range)`.
    pub fn set_latency(&self, latency: impl Fn(BlockRange) -> Duration + Send + Sync + 'static) {
        self.lock().latency = Some(Arc::new(latency));
    }

    /// Ranges fetched so far, in request order.
    pub fn fetched(&self) -> Vec<BlockRange> {
        self.lock().fetched.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> Result<(), FetchError> {
        match self.lock().failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn select(logs: &[RawLogEntry], range: BlockRange, tables: &[TableId]) -> Vec<RawLogEntry> {
    let mut selected: Vec<RawLogEntry> = logs
        .iter()
        .filter(|e| range.contains(e.block_number))
        .filter(|e| tables.is_empty() || tables.contains(&e.table))
        .cloned()
        .collect();
    selected.sort_by_key(|e| (e.block_number, e.log_index));
    selected
}

fn broadcast(state: &mut MemoryState, batch: LiveBatch) {
    state
        .subscribers
        .retain(|tx| tx.send(batch.clone()).is_ok());
    debug!(range = %batch.range, subscribers = state.subscribers.len(), "live range announced");
}

impl LogSource for MemoryLogSource {
    async fn head(&self) -> Result<u64, FetchError> {
        self.take_failure()?;
        Ok(self.lock().head)
    }

    async fn fetch_logs(
        &self,
        range: BlockRange,
        tables: &[TableId],
    ) -> Result<Vec<RawLogEntry>, FetchError> {
        self.take_failure()?;
        let latency = {
            let mut state = self.lock();
            state.fetched.push(range);
            state.latency.clone()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency(range)).await;
        }
        Ok(select(&self.lock().logs, range, tables))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<LiveBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}
