//! Remote source traits and the data they deliver.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use stash_core::{Fields, RawLogEntry, TableDef, TableId};
use stash_store::Stash;
use tokio::sync::mpsc;

use crate::error::FetchError;

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn single(block: u64) -> Self {
        Self::new(block, block)
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    /// Number of blocks covered.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.from <= block && block <= self.to
    }

    /// Split into consecutive ranges of at most `max_len` blocks.
    pub fn split(self, max_len: u64) -> Vec<BlockRange> {
        let max_len = max_len.max(1);
        let mut ranges = Vec::new();
        if self.is_empty() {
            return ranges;
        }
        let mut from = self.from;
        loop {
            let to = from.saturating_add(max_len - 1).min(self.to);
            ranges.push(BlockRange::new(from, to));
            if to == self.to {
                break;
            }
            from = to + 1;
        }
        ranges
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// A range announced by the live subscription, with its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveBatch {
    pub range: BlockRange,
    pub logs: Vec<RawLogEntry>,
}

/// The remote append-only log.
///
/// `fetch_logs` returns the entries of `range` ordered by block and, within
/// a block, by original order. An empty `tables` filter means every table.
pub trait LogSource: Send + Sync + 'static {
    fn head(&self) -> impl Future<Output = Result<u64, FetchError>> + Send;

    fn fetch_logs(
        &self,
        range: BlockRange,
        tables: &[TableId],
    ) -> impl Future<Output = Result<Vec<RawLogEntry>, FetchError>> + Send;

    /// Open a live subscription. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<LiveBatch>;
}

/// One record of a snapshot, key fields included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub table: TableId,
    pub record: Fields,
}

/// Registry and record state pinned at a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub block_number: u64,
    #[serde(default)]
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub records: Vec<SnapshotRecord>,
}

impl Snapshot {
    /// Capture the current contents of a store as a snapshot at `block_number`.
    pub fn capture(stash: &Stash, block_number: u64) -> Self {
        let tables: Vec<TableDef> = stash
            .get_tables()
            .into_values()
            .flat_map(|names| names.into_values())
            .map(|table| (*table).clone())
            .collect();
        let records = tables
            .iter()
            .flat_map(|table| {
                stash
                    .get_records(&table.id)
                    .into_iter()
                    .map(move |record| SnapshotRecord {
                        table: table.id.clone(),
                        record,
                    })
            })
            .collect();
        Self {
            block_number,
            tables,
            records,
        }
    }
}

/// Source of point-in-time snapshots.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetch a snapshot, pinned at `block` when given. `None` means no snapshot is available.
    fn fetch_snapshot(
        &self,
        block: Option<u64>,
        tables: &[TableId],
    ) -> impl Future<Output = Result<Option<Snapshot>, FetchError>> + Send;
}

/// A snapshot source that never has a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshot;

impl SnapshotSource for NoSnapshot {
    async fn fetch_snapshot(
        &self,
        _block: Option<u64>,
        _tables: &[TableId],
    ) -> Result<Option<Snapshot>, FetchError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_into_bounded_ranges() {
        let ranges = BlockRange::new(0, 9).split(4);
        assert_eq!(
            ranges,
            vec![
                BlockRange::new(0, 3),
                BlockRange::new(4, 7),
                BlockRange::new(8, 9),
            ]
        );
        assert_eq!(BlockRange::new(5, 5).split(100), vec![BlockRange::single(5)]);
        assert!(BlockRange::new(6, 5).split(10).is_empty());
    }

    #[test]
    fn split_without_chunking_keeps_one_range() {
        let ranges = BlockRange::new(10, 1_000_000).split(u64::MAX);
        assert_eq!(ranges, vec![BlockRange::new(10, 1_000_000)]);
    }

    #[test]
    fn split_near_u64_max_terminates() {
        let ranges = BlockRange::new(u64::MAX - 2, u64::MAX).split(2);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].to, u64::MAX);
    }

    #[test]
    fn range_len_and_contains() {
        let range = BlockRange::new(3, 7);
        assert_eq!(range.len(), 5);
        assert!(range.contains(3) && range.contains(7));
        assert!(!range.contains(8));
        assert_eq!(range.to_string(), "[3, 7]");
    }
}
