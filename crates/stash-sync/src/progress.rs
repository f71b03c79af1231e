//! Sync progress tracker — mirrors pipeline progress into the store.
//!
//! Progress is written to the singleton record of the internal
//! `sync:SyncProgress` table, so anything subscribed to the store sees it
//! through the usual notifications. Once `live` has been reported, later
//! updates are ignored.

use primitive_types::U256;
use stash_core::{FieldSpec, Fields, PrimitiveKind, TableDef, TableId, Value};
use stash_store::{Stash, StashResult};
use tracing::debug;

use crate::pipeline::{SyncProgress, SyncStep};

pub const PROGRESS_NAMESPACE: &str = "sync";
pub const PROGRESS_TABLE: &str = "SyncProgress";

/// Id of the internal progress table.
pub fn progress_table_id() -> TableId {
    TableId::new(PROGRESS_NAMESPACE, PROGRESS_TABLE)
}

/// Definition of the internal progress table. It has an empty key.
pub fn progress_table() -> TableDef {
    let field = |name: &str, kind: PrimitiveKind| FieldSpec {
        name: name.to_string(),
        kind,
    };
    TableDef {
        id: progress_table_id(),
        schema: vec![
            field("step", PrimitiveKind::String),
            field("percentage", PrimitiveKind::Uint(32)),
            field("latestBlockNumber", PrimitiveKind::Uint(256)),
            field("lastBlockNumberProcessed", PrimitiveKind::Uint(256)),
            field("message", PrimitiveKind::String),
        ],
        key: Vec::new(),
    }
}

/// Progress as stored in the progress table.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedProgress {
    pub step: SyncStep,
    pub percentage: f64,
    pub latest_block_number: u64,
    pub last_block_number_processed: u64,
    pub message: String,
}

impl TrackedProgress {
    /// Read the progress record from a store, if one has been written.
    pub fn read(stash: &Stash) -> Option<Self> {
        let record = stash.get_record(&progress_table_id(), &Fields::new())?;
        Some(Self {
            step: SyncStep::parse(record.get("step")?.as_str()?)?,
            percentage: record.get("percentage")?.as_u64()? as f64 / 100.0,
            latest_block_number: record.get("latestBlockNumber")?.as_u64()?,
            last_block_number_processed: record.get("lastBlockNumberProcessed")?.as_u64()?,
            message: record.get("message")?.as_str()?.to_string(),
        })
    }
}

pub struct ProgressTracker {
    stash: Stash,
    live_reported: bool,
}

impl ProgressTracker {
    /// Register the progress table on `stash` and track into it.
    pub fn new(stash: Stash) -> StashResult<Self> {
        stash.register_table(progress_table())?;
        Ok(Self {
            stash,
            live_reported: false,
        })
    }

    /// Record a progress update. Returns whether the store was written.
    ///
    /// Only the snapshot, catch-up and live steps are tracked; anything
    /// after `live` has been reported is ignored.
    pub fn record(&mut self, progress: &SyncProgress) -> StashResult<bool> {
        if self.live_reported {
            return Ok(false);
        }
        if !matches!(
            progress.step,
            SyncStep::Snapshot | SyncStep::CatchUp | SyncStep::Live
        ) {
            return Ok(false);
        }
        let hundredths = (progress.percentage.clamp(0.0, 100.0) * 100.0).round() as u32;
        let value = Fields::from([
            ("step".to_string(), Value::from(progress.step.as_str())),
            ("percentage".to_string(), Value::from(hundredths)),
            (
                "latestBlockNumber".to_string(),
                Value::from(U256::from(progress.latest_block_number)),
            ),
            (
                "lastBlockNumberProcessed".to_string(),
                Value::from(U256::from(progress.last_block_number_processed.unwrap_or(0))),
            ),
            ("message".to_string(), Value::from(progress.message.as_str())),
        ]);
        self.stash
            .set_record(&progress_table_id(), &Fields::new(), &value)?;
        if progress.step == SyncStep::Live {
            debug!("sync progress reached live");
            self.live_reported = true;
        }
        Ok(true)
    }

    pub fn current(&self) -> Option<TrackedProgress> {
        TrackedProgress::read(&self.stash)
    }

    pub fn live_reported(&self) -> bool {
        self.live_reported
    }
}
