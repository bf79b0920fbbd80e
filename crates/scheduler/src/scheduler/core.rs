//! [`CronScheduler`] — single-timer dispatch over the scheduled index.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::SchedulerError;
use crate::executor::{ErrorHook, Executor, RunHandle, RunId, TaskId};

use super::cron::{CronParser, UtcCronParser, HORIZON_UNIX};
use super::entry::{RunningEntry, ScheduledEntry};
use super::index::{RunningRegistry, ScheduledIndex};

/// Deadline applied to each advisory cancel issued by
/// [`CronScheduler::release`].
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle wake interval when no task is scheduled.
pub const MAX_WAIT: Duration = Duration::from_secs(1_000_000 * 3_600);

/// Default cap on concurrently outstanding runs.
pub const DEFAULT_MAX_RUNS_OUTSTANDING: usize = 1 << 16;

// ── Engine state ────────────────────────────────────────────────────

/// State guarded by the engine lock. Both indexes and the armed wake time
/// move together under one critical section.
struct EngineState {
    scheduled: ScheduledIndex,
    running: RunningRegistry,
    /// Wake time the dispatch worker is currently armed for.
    when: DateTime<Utc>,
    /// Task the dispatch worker has popped but not yet re-queued.
    in_dispatch: Option<TaskId>,
    /// Set when `release` hits the task currently in dispatch; the worker
    /// drops the entry instead of re-queueing it.
    dispatch_released: bool,
}

struct Shared {
    state: RwLock<EngineState>,
    executor: Arc<dyn Executor>,
    on_error: ErrorHook,
    clock: Arc<dyn Clock>,
    parser: Arc<dyn CronParser>,
    /// Counting semaphore capping outstanding runs. Closed on shutdown so a
    /// pending acquisition returns immediately without running.
    limiter: Arc<Semaphore>,
    /// Wakes the dispatch worker when the head of the index moves earlier.
    rearm: Notify,
    /// Detached waiters and cancellation probes, awaited by `stop`.
    tasks: TaskTracker,
}

// ── Builder ─────────────────────────────────────────────────────────

/// Builder for [`CronScheduler`]. Obtained via [`CronScheduler::builder`].
pub struct SchedulerBuilder {
    executor: Arc<dyn Executor>,
    on_error: ErrorHook,
    max_runs_outstanding: usize,
    clock: Arc<dyn Clock>,
    parser: Arc<dyn CronParser>,
}

impl SchedulerBuilder {
    /// Install a custom error hook. The default is a no-op returning `true`.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(TaskId, RunId, DateTime<Utc>, &SchedulerError) -> bool + Send + Sync + 'static,
    {
        self.on_error = Arc::new(hook);
        self
    }

    /// Cap the number of concurrently outstanding runs. Defaults to
    /// [`DEFAULT_MAX_RUNS_OUTSTANDING`].
    pub fn max_runs_outstanding(mut self, cap: usize) -> Self {
        self.max_runs_outstanding = cap;
        self
    }

    /// Substitute the time source. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Substitute the cron parser collaborator. Defaults to
    /// [`UtcCronParser`].
    pub fn cron_parser(mut self, parser: Arc<dyn CronParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Spawn the dispatch worker and return the running engine. Must be
    /// called within a tokio runtime.
    pub fn build(self) -> CronScheduler {
        let now = self.clock.now();
        let shared = Arc::new(Shared {
            state: RwLock::new(EngineState {
                scheduled: ScheduledIndex::default(),
                running: RunningRegistry::default(),
                when: far_future(now),
                in_dispatch: None,
                dispatch_released: false,
            }),
            executor: self.executor,
            on_error: self.on_error,
            clock: self.clock,
            parser: self.parser,
            limiter: Arc::new(Semaphore::new(self.max_runs_outstanding)),
            rearm: Notify::new(),
            tasks: TaskTracker::new(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(dispatch_loop(shared.clone(), shutdown_rx));

        info!(
            max_runs_outstanding = self.max_runs_outstanding,
            "scheduler started"
        );
        CronScheduler {
            shared,
            shutdown_tx,
            dispatch,
        }
    }
}

// ── Public surface ──────────────────────────────────────────────────

/// In-memory cron-driven task scheduler.
///
/// Tasks are registered with [`schedule`](CronScheduler::schedule) and keep
/// firing until [`release`](CronScheduler::release)d. A single dispatch
/// worker pops the earliest-due task, hands it to the executor, and
/// re-queues it at its next cron instant.
pub struct CronScheduler {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
}

impl CronScheduler {
    /// Start building a scheduler around `executor`.
    pub fn builder(executor: Arc<dyn Executor>) -> SchedulerBuilder {
        SchedulerBuilder {
            executor,
            on_error: Arc::new(|_, _, _, _| true),
            max_runs_outstanding: DEFAULT_MAX_RUNS_OUTSTANDING,
            clock: Arc::new(SystemClock),
            parser: Arc::new(UtcCronParser),
        }
    }

    /// Register `id`, or replace its registration in place.
    ///
    /// The first firing is `next(since) + offset`. When the new instant is
    /// earlier than the armed wake time the dispatch worker is re-armed.
    /// Fails on a malformed cron expression (the index is untouched) or when
    /// the expression yields no instant before the horizon.
    pub fn schedule(
        &self,
        id: TaskId,
        cron_expr: &str,
        offset: Duration,
        since: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let cron = self.shared.parser.parse(cron_expr)?;
        let offset_delta =
            chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        let first = cron
            .next_after(since)
            .ok_or(SchedulerError::NoFutureFiring { task: id })?
            + offset_delta;

        let entry = ScheduledEntry {
            task: id,
            cron,
            fire_at: first.timestamp(),
            nonce: 0,
            offset,
        };

        let mut state = self.shared.state.write().unwrap();
        state.scheduled.upsert(entry);
        if first < state.when {
            state.when = first;
            self.shared.rearm.notify_one();
        }
        debug!(task = %id, cron = %cron_expr, first = %first, "task scheduled");
        Ok(())
    }

    /// Remove `id`'s registration and cancel its in-flight runs.
    ///
    /// Cancellation is advisory: each handle gets a [`CANCEL_TIMEOUT`]
    /// deadline on a detached task; the run's waiter still drains normally.
    /// Unknown ids are a no-op.
    pub fn release(&self, id: TaskId) {
        let handles = {
            let mut state = self.shared.state.write().unwrap();
            state.scheduled.remove_by_task(id);
            if state.in_dispatch == Some(id) {
                state.dispatch_released = true;
            }
            state.running.drain_task(id)
        };

        if handles.is_empty() {
            return;
        }
        debug!(task = %id, runs = handles.len(), "releasing task; cancelling runs");
        for handle in handles {
            self.shared.tasks.spawn(cancel_run(id, handle));
        }
    }

    /// Snapshot of the run ids currently in flight for `id`, ascending, at
    /// most `limit` entries.
    pub fn runs(&self, id: TaskId, limit: usize) -> Vec<RunId> {
        self.shared.state.read().unwrap().running.list_by_task(id, limit)
    }

    /// The wake time the dispatch worker is currently armed for. Far-future
    /// when nothing is scheduled.
    pub fn when(&self) -> DateTime<Utc> {
        self.shared.state.read().unwrap().when
    }

    /// Number of scheduled tasks.
    pub fn len(&self) -> usize {
        self.shared.state.read().unwrap().scheduled.len()
    }

    /// Number of runs currently in flight across all tasks. Never exceeds
    /// the configured outstanding-runs cap.
    pub fn outstanding_runs(&self) -> usize {
        self.shared.state.read().unwrap().running.len()
    }

    /// Whether any task is scheduled.
    pub fn is_empty(&self) -> bool {
        self.shared.state.read().unwrap().scheduled.is_empty()
    }

    /// Stop the dispatch worker, then wait for every spawned waiter.
    ///
    /// After this returns the scheduled index is frozen and no further run
    /// starts. In-flight runs are awaited to natural completion, not
    /// cancelled.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if (&mut self.dispatch).await.is_err() {
            warn!("dispatch worker panicked");
        }
        // The worker closes the limiter on its way out; repeat in case it
        // died before reaching that point.
        self.shared.limiter.close();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        info!("scheduler stopped");
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        // Best-effort: stop the dispatch worker even when the engine is
        // dropped without `stop`.
        let _ = self.shutdown_tx.send(true);
    }
}

// ── Dispatch worker ─────────────────────────────────────────────────

async fn dispatch_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        // Arm the timer to the current head, or the far-future sentinel when
        // the index is empty.
        let wake_at = {
            let mut state = shared.state.write().unwrap();
            let wake_at = match state.scheduled.next_fire_at() {
                Some(at) => DateTime::from_timestamp(at, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                None => far_future(shared.clock.now()),
            };
            state.when = wake_at;
            wake_at
        };

        tokio::select! {
            _ = shutdown_rx.changed() => {
                shared.limiter.close();
                debug!("dispatch worker stopping");
                return;
            }
            // Head moved earlier; recompute and re-arm.
            _ = shared.rearm.notified() => continue,
            _ = shared.clock.sleep_until(wake_at) => {}
        }

        // Pop the head only if it is actually due: a released head leaves a
        // later entry behind that must not fire early.
        let now = shared.clock.now().timestamp();
        let entry = {
            let mut state = shared.state.write().unwrap();
            match state.scheduled.next_fire_at() {
                Some(at) if at <= now => {
                    let entry = state.scheduled.pop_min();
                    if let Some(ref entry) = entry {
                        state.in_dispatch = Some(entry.task);
                        state.dispatch_released = false;
                    }
                    entry
                }
                _ => None,
            }
        };
        let Some(entry) = entry else { continue };

        if !dispatch_one(&shared, &mut shutdown_rx, entry).await {
            return;
        }
    }
}

/// Fire one popped entry: acquire a limiter unit, invoke the executor,
/// advance the cron schedule, re-queue, and record the in-flight run.
/// Returns `false` when the engine is shutting down.
async fn dispatch_one(
    shared: &Arc<Shared>,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut entry: ScheduledEntry,
) -> bool {
    // Take the limiter unit before invoking the executor: the registry never
    // exceeds capacity, and when the limiter is full the dispatch worker
    // blocks here, throttling further firings.
    let permit: OwnedSemaphorePermit = tokio::select! {
        _ = shutdown_rx.changed() => {
            finish_dispatch(shared, entry, None);
            shared.limiter.close();
            return false;
        }
        acquired = shared.limiter.clone().acquire_owned() => match acquired {
            Ok(permit) => permit,
            // Limiter closed: the engine is stopping.
            Err(_) => {
                finish_dispatch(shared, entry, None);
                return false;
            }
        },
    };

    // The task may have been released while the worker was parked on the
    // limiter; it must not reach the executor.
    if shared.state.read().unwrap().dispatch_released {
        finish_dispatch(shared, entry, None);
        drop(permit);
        return true;
    }

    let task = entry.task;
    let fired_at = entry.fire_instant();
    debug!(task = %task, at = %fired_at, "dispatching task");

    let outcome = shared.executor.execute(task, fired_at).await;

    // Advance to the next instant before touching the registry so the task
    // is never lost, whatever the run outcome.
    advance_entry(shared, &mut entry, fired_at);

    let started = match &outcome {
        Ok(Some(handle)) => Some(handle),
        _ => None,
    };
    let released = finish_dispatch(shared, entry, started);

    match outcome {
        Ok(Some(handle)) => {
            if released {
                // The task was released while its run was starting; cancel
                // rather than track.
                let cancel_handle = Arc::clone(&handle);
                shared.tasks.spawn(cancel_run(task, cancel_handle));
            }
            let run = handle.id();
            shared
                .tasks
                .spawn(run_waiter(Arc::clone(shared), task, run, fired_at, handle, permit));
        }
        Ok(None) => drop(permit),
        Err(e) => {
            drop(permit);
            let err = SchedulerError::ExecutorFailed(e);
            warn!(task = %task, error = %err, "executor rejected firing");
            (shared.on_error)(task, RunId::NONE, fired_at, &err);
        }
    }
    true
}

/// Compute the next firing for a just-fired entry.
///
/// The cron grid instant is recovered as `fire_at - offset` so the offset is
/// honored on every firing, not only the first. When no instant exists
/// before the horizon the entry is parked at the horizon with a bumped nonce
/// so the task stays visible to `release`, and the error hook is told.
fn advance_entry(shared: &Shared, entry: &mut ScheduledEntry, fired_at: DateTime<Utc>) {
    let offset =
        chrono::Duration::from_std(entry.offset).unwrap_or_else(|_| chrono::Duration::zero());
    match entry.cron.next_after(fired_at - offset) {
        Some(next) => {
            let next_fire = (next + offset).timestamp();
            if next_fire == entry.fire_at {
                // Re-queued at an occupied second; the nonce keeps the key
                // unique.
                entry.nonce += 1;
            }
            entry.fire_at = next_fire;
        }
        None => {
            entry.nonce += 1;
            entry.fire_at = HORIZON_UNIX;
            let err = SchedulerError::NoFutureFiring { task: entry.task };
            warn!(task = %entry.task, "no firing before horizon; parking task");
            (shared.on_error)(entry.task, RunId::NONE, fired_at, &err);
        }
    }
}

/// Return a dispatched entry to the index and record its run, unless the
/// task was released or re-registered while the lock was dropped. Reports
/// whether a release happened mid-dispatch.
fn finish_dispatch(
    shared: &Shared,
    entry: ScheduledEntry,
    started: Option<&Arc<dyn RunHandle>>,
) -> bool {
    let mut state = shared.state.write().unwrap();
    let released = state.dispatch_released;
    state.in_dispatch = None;
    state.dispatch_released = false;

    let task = entry.task;
    if !released && !state.scheduled.contains(task) {
        state.scheduled.upsert(entry);
    }
    if let Some(handle) = started {
        if !released {
            state.running.insert(RunningEntry {
                task,
                run: handle.id(),
                handle: Arc::clone(handle),
            });
        }
    }
    released
}

/// Detached waiter for one in-flight run. Holds the limiter unit for the
/// run's lifetime and clears the registry entry when the run resolves.
async fn run_waiter(
    shared: Arc<Shared>,
    task: TaskId,
    run: RunId,
    scheduled_at: DateTime<Utc>,
    handle: Arc<dyn RunHandle>,
    permit: OwnedSemaphorePermit,
) {
    match handle.wait().await {
        Ok(()) => {
            debug!(task = %task, run = %run, "run completed");
        }
        Err(e) => {
            let err = SchedulerError::RunFailed(e);
            warn!(task = %task, run = %run, error = %err, "run failed");
            (shared.on_error)(task, run, scheduled_at, &err);
        }
    }
    shared.state.write().unwrap().running.remove(task, run);
    drop(permit);
}

/// Advisory cancel with a bounded deadline.
async fn cancel_run(task: TaskId, handle: Arc<dyn RunHandle>) {
    if tokio::time::timeout(CANCEL_TIMEOUT, handle.cancel())
        .await
        .is_err()
    {
        warn!(task = %task, "cancel did not acknowledge within deadline");
    }
}

fn far_future(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::from_std(MAX_WAIT).unwrap_or_else(|_| chrono::Duration::zero())
}
