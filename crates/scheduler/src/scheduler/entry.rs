//! Scheduled and running entries and their ordering keys.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::executor::{RunHandle, RunId, TaskId};

use super::cron::FiringSchedule;

/// Ordering key for the scheduled index: `(fire_at, nonce, task)`.
///
/// The lexicographic order makes extract-min deterministic: tasks due at the
/// same second dispatch in ascending task-id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FireKey {
    pub fire_at: i64,
    pub nonce: u64,
    pub task: TaskId,
}

/// A task waiting for its next firing. At most one exists per task.
#[derive(Clone)]
pub(crate) struct ScheduledEntry {
    pub task: TaskId,
    pub cron: Arc<dyn FiringSchedule>,
    /// Unix second of the next firing, offset included.
    pub fire_at: i64,
    /// Tie-break counter; bumped when the task is re-queued at a second it
    /// already occupied.
    pub nonce: u64,
    /// Fixed delay applied after each cron instant.
    pub offset: Duration,
}

impl ScheduledEntry {
    pub(crate) fn key(&self) -> FireKey {
        FireKey {
            fire_at: self.fire_at,
            nonce: self.nonce,
            task: self.task,
        }
    }

    /// The firing instant as a wall-clock time.
    pub(crate) fn fire_instant(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.fire_at, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// An in-flight run and its cancel handle. A task may own several at once
/// when a long run overlaps a newly dispatched one.
pub(crate) struct RunningEntry {
    pub task: TaskId,
    pub run: RunId,
    pub handle: Arc<dyn RunHandle>,
}
