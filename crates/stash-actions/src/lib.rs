//! stash-actions — optimistic actions over a confirmed [`Stash`](stash_store::Stash).
//!
//! An action declares a requirement (read against the store plus every
//! earlier pending action's writes), the writes it expects to cause, and an
//! execute step. While it runs, its writes are visible through the
//! [`overlay`] but never touch the confirmed store. The action resolves as
//! confirmed once a confirmed update lands on one of its keys, or as failed
//! on error or timeout; either way its overlay contribution is dropped.

pub mod action;
pub mod error;
pub mod overlay;
pub mod queue;

pub use action::{ActionInfo, ActionRequest, ActionStatus};
pub use error::ActionError;
pub use overlay::{overlay, OverlayView, ReadSet, RecordRef, RecordWrite, TrackingView};
pub use queue::ActionQueue;
