//! The scheduler engine.
//!
//! [`CronScheduler`] owns an ordered index of pending firings, a registry of
//! in-flight runs, and a single dispatch worker multiplexing every task onto
//! one re-armable timer. Callers mutate the index through the public surface
//! under the engine lock; the dispatch worker consumes from the same index,
//! produces into the run registry, and drains back out as runs complete.

mod core;
pub(crate) mod cron;
mod entry;
mod index;


pub use self::core::{
    CronScheduler, SchedulerBuilder, CANCEL_TIMEOUT, DEFAULT_MAX_RUNS_OUTSTANDING, MAX_WAIT,
};
pub use self::cron::{CronParser, FiringSchedule, UtcCronParser};
