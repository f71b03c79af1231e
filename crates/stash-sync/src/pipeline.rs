//! Hydration pipeline — drives the store from snapshot through catch-up to live.
//!
//! Catch-up fetches up to `prefetch` ranges concurrently but applies them
//! strictly in ascending order. Every applied range advances
//! `last_block_number_processed`; blocks at or below it are never applied
//! again, so re-delivered ranges are harmless.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use stash_core::config::SyncSection;
use stash_core::{Operation, RawEvent, RawLogEntry, TableId};
use stash_store::Stash;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::SyncError;
use crate::progress::ProgressTracker;
use crate::retry::RetryPolicy;
use crate::source::{BlockRange, LiveBatch, LogSource, NoSnapshot, Snapshot, SnapshotSource};

/// Called after each applied block with its number and the operations applied in it.
pub type BlockHook = Arc<dyn Fn(u64, &[Operation]) + Send + Sync>;

/// Tuning for a [`HydrationPipeline`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// First block to replay when no snapshot is loaded.
    pub start_block: u64,
    pub max_block_range: u64,
    /// When false, catch-up fetches the whole backlog as one range.
    pub enable_chunking: bool,
    /// Maximum range fetches in flight.
    pub prefetch: usize,
    pub retry: RetryPolicy,
    /// Tables to sync. Empty means every table.
    pub filters: Vec<TableId>,
    /// Snapshot to seed from instead of asking the snapshot source.
    pub initial_state: Option<Snapshot>,
    /// Block to pin snapshot requests at.
    pub snapshot_block: Option<u64>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncSection::default())
    }
}

impl From<&SyncSection> for SyncOptions {
    fn from(section: &SyncSection) -> Self {
        Self {
            start_block: section.start_block,
            max_block_range: section.max_block_range,
            enable_chunking: section.enable_chunking,
            prefetch: section.prefetch,
            retry: RetryPolicy::from(&section.retry),
            filters: Vec::new(),
            initial_state: None,
            snapshot_block: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStep {
    Idle,
    Snapshot,
    #[serde(rename = "catchup")]
    CatchUp,
    Live,
    Error,
    Stopped,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::Idle => "idle",
            SyncStep::Snapshot => "snapshot",
            SyncStep::CatchUp => "catchup",
            SyncStep::Live => "live",
            SyncStep::Error => "error",
            SyncStep::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "idle" => SyncStep::Idle,
            "snapshot" => SyncStep::Snapshot,
            "catchup" => SyncStep::CatchUp,
            "live" => SyncStep::Live,
            "error" => SyncStep::Error,
            "stopped" => SyncStep::Stopped,
            _ => return None,
        })
    }

    /// Whether the pipeline has stopped making progress for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStep::Error | SyncStep::Stopped)
    }
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published after every state transition and every applied range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub step: SyncStep,
    /// 0 to 100.
    pub percentage: f64,
    pub latest_block_number: u64,
    pub last_block_number_processed: Option<u64>,
    pub message: String,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            step: SyncStep::Idle,
            percentage: 0.0,
            latest_block_number: 0,
            last_block_number_processed: None,
            message: String::new(),
        }
    }
}

fn percentage(last: Option<u64>, latest: u64) -> f64 {
    match last {
        None => 0.0,
        Some(_) if latest == 0 => 100.0,
        Some(last) => (100.0 * last as f64 / latest as f64).min(100.0),
    }
}

/// Handle to a pipeline running on its own task.
pub struct SyncHandle {
    progress: watch::Receiver<SyncProgress>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), SyncError>>,
}

impl SyncHandle {
    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    pub fn current(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// Ask the pipeline to stop. Safe to call more than once.
    ///
    /// Queued catch-up work is abandoned and in-flight fetch results are
    /// discarded; the store keeps its last applied state.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pipeline to end and return its outcome.
    pub async fn join(self) -> Result<(), SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Aborted(e.to_string())),
        }
    }
}

/// Hydrates a [`Stash`] from a log source.
pub struct HydrationPipeline<S, P = NoSnapshot> {
    stash: Stash,
    source: Arc<S>,
    snapshots: Arc<P>,
    options: SyncOptions,
    block_hook: Option<BlockHook>,
    tracker: Option<ProgressTracker>,
    progress: watch::Sender<SyncProgress>,
    step: SyncStep,
    last_processed: Option<u64>,
    latest: u64,
}

impl<S: LogSource> HydrationPipeline<S, NoSnapshot> {
    pub fn new(stash: Stash, source: S, options: SyncOptions) -> Self {
        let (progress, _) = watch::channel(SyncProgress::default());
        Self {
            stash,
            source: Arc::new(source),
            snapshots: Arc::new(NoSnapshot),
            options,
            block_hook: None,
            tracker: None,
            progress,
            step: SyncStep::Idle,
            last_processed: None,
            latest: 0,
        }
    }
}

impl<S: LogSource, P: SnapshotSource> HydrationPipeline<S, P> {
    /// Use a snapshot source for the initial state.
    pub fn with_snapshot_source<Q: SnapshotSource>(self, snapshots: Q) -> HydrationPipeline<S, Q> {
        HydrationPipeline {
            stash: self.stash,
            source: self.source,
            snapshots: Arc::new(snapshots),
            options: self.options,
            block_hook: self.block_hook,
            tracker: self.tracker,
            progress: self.progress,
            step: self.step,
            last_processed: self.last_processed,
            latest: self.latest,
        }
    }

    pub fn with_block_hook(
        mut self,
        hook: impl Fn(u64, &[Operation]) + Send + Sync + 'static,
    ) -> Self {
        self.block_hook = Some(Arc::new(hook));
        self
    }

    /// Mirror progress into the store through `tracker`.
    pub fn with_progress_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn step(&self) -> SyncStep {
        self.step
    }

    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    /// Spawn the full lifecycle on the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(self) -> SyncHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let progress = self.progress.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        SyncHandle {
            progress,
            shutdown,
            task,
        }
    }

    /// Snapshot, catch-up, then live until `shutdown` flips to true.
    ///
    /// The live subscription is opened before catch-up so nothing announced
    /// meanwhile is lost. Dropping the shutdown sender does not stop the
    /// pipeline.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut live = self.source.subscribe();
        let outcome = tokio::select! {
            biased;
            () = shutdown_requested(&mut shutdown) => None,
            result = self.sync(&mut live) => Some(result),
        };
        match outcome {
            None => {
                info!(last_processed = ?self.last_processed, "sync stopped");
                self.transition(SyncStep::Stopped, "stopped");
                Ok(())
            }
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Snapshot and catch-up only, without live tailing.
    ///
    /// Returns the last processed block.
    pub async fn hydrate(&mut self) -> Result<Option<u64>, SyncError> {
        match self.load_and_catch_up().await {
            Ok(()) => Ok(self.last_processed),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn sync(&mut self, live: &mut mpsc::UnboundedReceiver<LiveBatch>) -> Result<(), SyncError> {
        self.load_and_catch_up().await?;
        self.transition(SyncStep::Live, "live");
        while let Some(batch) = live.recv().await {
            self.apply_live(batch).await?;
        }
        Err(SyncError::LiveClosed)
    }

    async fn load_and_catch_up(&mut self) -> Result<(), SyncError> {
        self.load_snapshot().await?;
        self.transition(SyncStep::CatchUp, "catching up");
        let head = {
            let source = Arc::clone(&self.source);
            self.options.retry.run("head", || source.head()).await?
        };
        self.latest = self.latest.max(head);
        let next = self.next_block();
        if next <= head {
            info!(from = next, to = head, "catching up");
            self.replay(BlockRange::new(next, head)).await?;
        }
        self.publish("caught up");
        Ok(())
    }

    // ── Snapshot ───────────────────────────────────────────────────

    async fn load_snapshot(&mut self) -> Result<(), SyncError> {
        let snapshot = match self.options.initial_state.take() {
            Some(snapshot) => Some(snapshot),
            None => {
                let snapshots = Arc::clone(&self.snapshots);
                let block = self.options.snapshot_block;
                let filters = self.options.filters.clone();
                self.options
                    .retry
                    .run("snapshot", || snapshots.fetch_snapshot(block, &filters))
                    .await?
            }
        };
        match snapshot {
            Some(snapshot) => {
                self.transition(SyncStep::Snapshot, "loading snapshot");
                self.install_snapshot(snapshot)?;
            }
            None => {
                self.last_processed = self.options.start_block.checked_sub(1);
                debug!(start_block = self.options.start_block, "no snapshot, replaying from start block");
            }
        }
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), SyncError> {
        for table in snapshot.tables {
            if self.wants(&table.id) {
                self.stash.register_table(table)?;
            }
        }
        let ops: Vec<Operation> = snapshot
            .records
            .into_iter()
            .filter(|r| self.wants(&r.table))
            .map(|r| Operation::SetRecord {
                table: r.table,
                key: r.record.clone(),
                value: r.record,
            })
            .collect();
        let summary = self.stash.apply_all(&ops);
        self.last_processed = Some(snapshot.block_number);
        self.latest = self.latest.max(snapshot.block_number);
        info!(
            block = snapshot.block_number,
            records = summary.applied,
            skipped = summary.skipped,
            "snapshot loaded"
        );
        self.publish("snapshot loaded");
        Ok(())
    }

    // ── Range replay ───────────────────────────────────────────────

    /// Fetch `range` in bounded chunks, concurrently, and apply them in order.
    async fn replay(&mut self, range: BlockRange) -> Result<(), SyncError> {
        let chunk = if self.options.enable_chunking {
            self.options.max_block_range
        } else {
            u64::MAX
        };
        let ranges = range.split(chunk);
        let prefetch = self.options.prefetch.max(1);
        let source = Arc::clone(&self.source);
        let filters: Arc<[TableId]> = self.options.filters.clone().into();
        let retry = self.options.retry.clone();

        let mut fetches = stream::iter(ranges)
            .map(move |range| {
                let source = Arc::clone(&source);
                let filters = Arc::clone(&filters);
                let retry = retry.clone();
                async move {
                    let what = format!("logs {range}");
                    let logs = retry
                        .run(&what, || source.fetch_logs(range, &filters))
                        .await?;
                    Ok::<_, SyncError>((range, logs))
                }
            })
            .buffered(prefetch);

        while let Some(fetched) = fetches.next().await {
            let (range, logs) = fetched?;
            self.apply_range(range, logs)?;
            self.publish(&format!("applied blocks {range}"));
        }
        Ok(())
    }

    /// Apply one fetched range. Blocks at or below the last processed block are skipped.
    fn apply_range(&mut self, range: BlockRange, mut logs: Vec<RawLogEntry>) -> Result<(), SyncError> {
        let floor = self.next_block();
        if range.to < floor {
            debug!(%range, "range already applied");
            return Ok(());
        }
        logs.sort_by_key(|e| (e.block_number, e.log_index));

        let mut block = None;
        let mut pending: Vec<Operation> = Vec::new();
        let mut applied: Vec<Operation> = Vec::new();
        for entry in logs {
            if entry.block_number < floor || !range.contains(entry.block_number) {
                trace!(block = entry.block_number, %range, "dropping entry outside range");
                continue;
            }
            if block != Some(entry.block_number) {
                if let Some(done) = block {
                    self.finish_block(done, &mut pending, &mut applied);
                }
                block = Some(entry.block_number);
            }
            match entry.event {
                RawEvent::RegisterTable { table } => {
                    self.apply_ops(&mut pending, &mut applied);
                    if self.wants(&table.id) {
                        let id = table.id.clone();
                        self.stash.register_table(table)?;
                        debug!(table = %id, block = entry.block_number, "table registration applied");
                    }
                }
                _ if !self.wants(&entry.table) => {}
                _ => {
                    if let Some(op) = self.stash.decode(&entry) {
                        pending.push(op);
                    }
                }
            }
        }
        if let Some(done) = block {
            self.finish_block(done, &mut pending, &mut applied);
        }

        self.last_processed = Some(range.to);
        self.latest = self.latest.max(range.to);
        debug!(%range, "range applied");
        Ok(())
    }

    fn apply_ops(&self, pending: &mut Vec<Operation>, applied: &mut Vec<Operation>) {
        if pending.is_empty() {
            return;
        }
        self.stash.apply_all(pending);
        applied.append(pending);
    }

    fn finish_block(&self, block: u64, pending: &mut Vec<Operation>, applied: &mut Vec<Operation>) {
        self.apply_ops(pending, applied);
        trace!(block, ops = applied.len(), "block applied");
        if let Some(hook) = &self.block_hook {
            hook(block, applied);
        }
        applied.clear();
    }

    // ── Live ───────────────────────────────────────────────────────

    async fn apply_live(&mut self, batch: LiveBatch) -> Result<(), SyncError> {
        let LiveBatch { range, logs } = batch;
        if range.is_empty() {
            warn!(%range, "ignoring empty live range");
            return Ok(());
        }
        self.latest = self.latest.max(range.to);
        let next = self.next_block();
        if range.to < next {
            debug!(%range, "dropping stale live range");
            return Ok(());
        }
        if range.from > next {
            let gap = BlockRange::new(next, range.from - 1);
            info!(%gap, "live range skipped blocks, fetching gap");
            self.replay(gap).await?;
        }
        self.apply_range(range, logs)?;
        self.publish(&format!("applied live blocks {range}"));
        Ok(())
    }

    // ── Progress ───────────────────────────────────────────────────

    fn next_block(&self) -> u64 {
        self.last_processed.map_or(0, |b| b.saturating_add(1))
    }

    fn wants(&self, table: &TableId) -> bool {
        self.options.filters.is_empty() || self.options.filters.contains(table)
    }

    fn transition(&mut self, step: SyncStep, message: &str) {
        if self.step != step {
            info!(from = %self.step, to = %step, "sync step");
            self.step = step;
        }
        self.publish(message);
    }

    fn fail(&mut self, e: &SyncError) {
        error!(error = %e, last_processed = ?self.last_processed, "sync failed");
        self.transition(SyncStep::Error, &e.to_string());
    }

    fn publish(&mut self, message: &str) {
        let progress = SyncProgress {
            step: self.step,
            percentage: percentage(self.last_processed, self.latest),
            latest_block_number: self.latest,
            last_block_number_processed: self.last_processed,
            message: message.to_string(),
        };
        if let Some(tracker) = &mut self.tracker {
            if let Err(e) = tracker.record(&progress) {
                warn!(error = %e, "failed to record sync progress");
            }
        }
        // every published step closes a tick of store writes
        self.stash.end_tick();
        self.progress.send_replace(progress);
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
