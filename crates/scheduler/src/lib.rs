//! In-memory cron-driven task scheduler.
//!
//! Multiplexes an unbounded catalog of recurring tasks onto a single dispatch
//! worker with bounded concurrent execution. For each registered task the
//! engine computes the next firing instant from its cron expression, sleeps
//! until that moment, hands the task to the injected [`Executor`], tracks the
//! resulting in-flight run so it can be cancelled, and reschedules.
//!
//! The moving parts:
//! - an ordered index over pending firings with keyed removal
//! - a single re-armable timer driving the dispatch worker
//! - a registry of in-flight runs carrying per-run cancel handles
//! - a counting semaphore capping outstanding runs
//!
//! The schedule lives in memory. Durability, catch-up for missed firings, and
//! coordination between scheduler instances belong to the surrounding system.

pub mod clock;
pub mod error;
pub mod executor;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SchedulerError;
pub use executor::{ErrorHook, ExecuteError, Executor, RunHandle, RunId, TaskId};
pub use scheduler::{
    CronParser, CronScheduler, FiringSchedule, SchedulerBuilder, UtcCronParser, CANCEL_TIMEOUT,
    DEFAULT_MAX_RUNS_OUTSTANDING, MAX_WAIT,
};
