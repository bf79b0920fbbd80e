//! Scheduler error types.

use thiserror::Error;

use crate::executor::{ExecuteError, TaskId};

/// Errors produced by the scheduler engine.
///
/// Only [`SchedulerError::InvalidCron`] (and, for expressions already past
/// the horizon at registration, [`SchedulerError::NoFutureFiring`]) surface
/// from the public API. Runtime failures flow through the configured error
/// hook instead; none of them aborts the engine or other tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed. The task was not registered.
    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        source: cron::error::Error,
    },

    /// The cron schedule yields no firing instant before the year-2100
    /// horizon.
    #[error("task {task} has no firing before the horizon")]
    NoFutureFiring { task: TaskId },

    /// The executor failed before producing a run handle; the firing never
    /// started.
    #[error("executor failed to start run: {0}")]
    ExecutorFailed(ExecuteError),

    /// A run's handle resolved with an error; the run failed mid-flight.
    #[error("run failed: {0}")]
    RunFailed(ExecuteError),
}
