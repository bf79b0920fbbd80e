//! Time abstraction for the dispatch worker.
//!
//! Every wall-clock read and timer sleep goes through [`Clock`] so the engine
//! can be driven by a virtual clock in tests and deterministic replay.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Source of wall-clock time and timer sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once the clock reaches `deadline`. Returns immediately when
    /// the deadline is already in the past.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Real time, backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let delta = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(delta).await;
    }
}

/// Manually advanced clock for tests and deterministic replay.
///
/// Sleepers park on a watch channel and re-check the deadline whenever
/// [`advance`](ManualClock::advance) moves the clock.
#[derive(Debug)]
pub struct ManualClock {
    now_tx: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now_tx, _) = watch::channel(start);
        Self { now_tx }
    }

    /// Move the clock forward, waking every sleeper whose deadline has
    /// passed.
    pub fn advance(&self, dur: Duration) {
        self.now_tx.send_modify(|now| {
            *now = *now + chrono::Duration::from_std(dur).unwrap_or_else(|_| chrono::Duration::zero());
        });
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now_tx.borrow()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut now_rx = self.now_tx.subscribe();
        loop {
            if *now_rx.borrow_and_update() >= deadline {
                return;
            }
            if now_rx.changed().await.is_err() {
                // Clock dropped; park rather than fire early.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn manual_clock_starts_frozen() {
        let clock = ManualClock::new(utc("2024-01-01T00:00:00Z"));
        assert_eq!(clock.now(), utc("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(utc("2024-01-01T00:00:00Z"));
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), utc("2024-01-01T00:01:30Z"));
    }

    #[tokio::test]
    async fn sleep_until_past_deadline_returns_immediately() {
        let clock = ManualClock::new(utc("2024-01-01T00:01:00Z"));
        clock.sleep_until(utc("2024-01-01T00:00:00Z")).await;
    }

    #[tokio::test]
    async fn sleep_until_wakes_on_advance() {
        let clock = Arc::new(ManualClock::new(utc("2024-01-01T00:00:00Z")));
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep_until(utc("2024-01-01T00:01:00Z")).await;
            })
        };

        // Not enough: 30 s short of the deadline.
        clock.advance(Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(30));
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleeper should wake once the deadline passes")
            .unwrap();
    }
}
