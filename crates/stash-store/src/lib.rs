//! stash-store — the confirmed record layer.
//!
//! [`Stash`] holds every registered table's records in memory. Mutations are
//! applied synchronously and their diffs are buffered; subscribers receive
//! one aggregated notification per tick when the buffer is flushed.
//!
//! The store is `Clone` (backed by `Arc`) and can be shared across tasks.
//! Subscriber callbacks always run outside the store's locks, so a callback
//! may read the store or subscribe and unsubscribe freely.

pub mod error;
pub mod store;
pub mod subscription;
pub mod view;

pub use error::{StashError, StashResult, SubscriberError};
pub use store::{ApplySummary, Stash};
pub use subscription::{FlushReport, RecordUpdate, StashUpdate, Subscription, TableUpdate};
pub use view::RecordView;
