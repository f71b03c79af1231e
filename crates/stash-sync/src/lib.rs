//! stash-sync — keeps a [`Stash`](stash_store::Stash) in step with a remote log.
//!
//! The [`HydrationPipeline`] moves through `Idle → Snapshot → CatchUp → Live`:
//!
//! - **Snapshot**: optionally seeds tables and records pinned at a block.
//! - **CatchUp**: replays `[last + 1, head]` in bounded ranges, fetching
//!   several ranges concurrently but applying them strictly in order.
//! - **Live**: applies ranges announced by the source as they arrive,
//!   dropping stale blocks and fetching any gap first.
//!
//! Sources are consumed through the [`LogSource`] and [`SnapshotSource`]
//! traits; [`MemoryLogSource`] is an in-process source for tests and fixtures.
//! [`ProgressTracker`] mirrors pipeline progress into the store itself.

pub mod error;
pub mod memory;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod source;

pub use error::{FetchError, SyncError};
pub use memory::MemoryLogSource;
pub use pipeline::{BlockHook, HydrationPipeline, SyncHandle, SyncOptions, SyncProgress, SyncStep};
pub use progress::{ProgressTracker, TrackedProgress};
pub use retry::RetryPolicy;
pub use source::{BlockRange, LiveBatch, LogSource, NoSnapshot, Snapshot, SnapshotRecord, SnapshotSource};
