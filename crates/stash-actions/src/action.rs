//! Action requests and their lifecycle.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use stash_store::RecordView;

use crate::error::ActionError;
use crate::overlay::RecordWrite;

/// Lifecycle of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Queued; its requirement has not been met yet.
    Waiting,
    /// Requirement met, execute step running.
    Executing,
    /// Execute step finished, waiting for a confirmed update.
    Pending,
    Confirmed,
    Failed,
}

impl ActionStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ActionStatus::Confirmed | ActionStatus::Failed)
    }

    /// Whether the action's writes are visible in the overlay.
    pub fn is_active(&self) -> bool {
        matches!(self, ActionStatus::Executing | ActionStatus::Pending)
    }
}

/// Public snapshot of a queued action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionInfo {
    pub id: String,
    pub entity: Option<String>,
    pub status: ActionStatus,
    pub metadata: serde_json::Value,
}

type Requirement<T> = Box<dyn Fn(&dyn RecordView) -> Option<T> + Send + Sync>;
type Updates<T> = Box<dyn Fn(&dyn RecordView, &T) -> Vec<RecordWrite> + Send + Sync>;
type Execute<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, Result<(), ActionError>> + Send>;
pub(crate) type SuccessCallback = Box<dyn FnOnce() + Send>;
pub(crate) type ErrorCallback = Box<dyn FnOnce(&ActionError) + Send>;

/// An action to enqueue.
///
/// `requirement` reads the optimistic view and yields the data the action
/// needs, or `None` to keep waiting. `updates` turns that data into the
/// writes the action expects to cause, and `execute` performs it.
pub struct ActionRequest<T> {
    id: String,
    entity: Option<String>,
    requirement: Requirement<T>,
    updates: Updates<T>,
    execute: Execute<T>,
    timeout: Option<Duration>,
    may_not_write: bool,
    metadata: serde_json::Value,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl<T: Send + 'static> ActionRequest<T> {
    pub fn new<F, Fut>(
        id: impl Into<String>,
        requirement: impl Fn(&dyn RecordView) -> Option<T> + Send + Sync + 'static,
        execute: F,
    ) -> Self
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            entity: None,
            requirement: Box::new(requirement),
            updates: Box::new(|_: &dyn RecordView, _: &T| Vec::new()),
            execute: Box::new(move |data: T| execute(data).boxed()),
            timeout: None,
            may_not_write: false,
            metadata: serde_json::Value::Null,
            on_success: None,
            on_error: None,
        }
    }

    pub fn updates(
        mut self,
        updates: impl Fn(&dyn RecordView, &T) -> Vec<RecordWrite> + Send + Sync + 'static,
    ) -> Self {
        self.updates = Box::new(updates);
        self
    }

    /// The entity this action acts on, for display.
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Confirm as soon as execute succeeds instead of waiting for a store update.
    pub fn may_not_write(mut self) -> Self {
        self.may_not_write = true;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&ActionError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Erase the data type so the queue can hold actions of any `T`.
    pub(crate) fn into_erased(self) -> ErasedAction {
        let requirement = self.requirement;
        let updates = self.updates;
        let mut run_once = Some(self.execute);
        ErasedAction {
            id: self.id,
            entity: self.entity,
            timeout: self.timeout,
            may_not_write: self.may_not_write,
            metadata: self.metadata,
            on_success: self.on_success,
            on_error: self.on_error,
            prepare: Box::new(move |view: &dyn RecordView| {
                let data = requirement(view)?;
                let writes = updates(view, &data);
                let execute = run_once.take()?;
                Some(Prepared {
                    writes,
                    run: execute(data),
                })
            }),
        }
    }
}

/// An action whose requirement has been met.
pub(crate) struct Prepared {
    pub(crate) writes: Vec<RecordWrite>,
    pub(crate) run: BoxFuture<'static, Result<(), ActionError>>,
}

pub(crate) type Prepare = Box<dyn FnMut(&dyn RecordView) -> Option<Prepared> + Send>;

pub(crate) struct ErasedAction {
    pub(crate) id: String,
    pub(crate) entity: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) may_not_write: bool,
    pub(crate) metadata: serde_json::Value,
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) prepare: Prepare,
}
