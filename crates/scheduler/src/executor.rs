//! Executor and run-handle contracts, plus the identifiers that cross the
//! engine boundary.
//!
//! The engine never runs task bodies itself: each firing is handed to the
//! injected [`Executor`], which returns an optional [`RunHandle`] the engine
//! uses for cancellation and completion tracking.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Error type surfaced by executors and run handles.
pub type ExecuteError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque caller-supplied task identifier.
///
/// Total-ordered; two tasks due at the same instant dispatch in ascending
/// `TaskId` order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a single run, minted by the executor. Unique within its
/// task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    /// Sentinel handed to the error hook when no run was created.
    pub const NONE: RunId = RunId(0);
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Launches task runs on behalf of the dispatch worker.
///
/// Implementations must be safe for concurrent invocation: the engine calls
/// [`execute`](Executor::execute) for a task's next firing while earlier runs
/// of the same task may still be in flight.
///
/// `Ok(None)` marks the firing as fire-and-forget — the engine records
/// nothing and cannot cancel it. A synchronous `Err` means the run never
/// started; it is reported to the error hook and the task is rescheduled for
/// its next instant.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        task: TaskId,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Option<Arc<dyn RunHandle>>, ExecuteError>;
}

/// Handle to an in-flight run.
#[async_trait]
pub trait RunHandle: Send + Sync {
    /// Run identifier, unique within the owning task.
    fn id(&self) -> RunId;

    /// Advisory cancellation. The engine bounds each call with a 30 s
    /// deadline and does not wait for acknowledgement beyond it; the run's
    /// waiter still drains normally through [`wait`](RunHandle::wait).
    async fn cancel(&self);

    /// Resolves when the run completes. `Err` marks the run as failed
    /// mid-flight and is reported to the error hook.
    async fn wait(&self) -> Result<(), ExecuteError>;
}

/// Hook invoked for cron-advance failures, executor failures, and failed
/// runs.
///
/// `run` is [`RunId::NONE`] when no run was created. The boolean return is
/// reserved for a future drop-task-on-repeated-failure policy; the engine
/// currently ignores it. The default hook is a no-op returning `true`.
pub type ErrorHook =
    Arc<dyn Fn(TaskId, RunId, DateTime<Utc>, &SchedulerError) -> bool + Send + Sync>;
