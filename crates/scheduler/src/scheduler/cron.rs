//! Cron parsing and successor computation.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::SchedulerError;

/// Unix second of 2100-01-01T00:00:00Z. Schedules that cannot produce an
/// instant before this are treated as terminal for that firing.
pub(crate) const HORIZON_UNIX: i64 = 4_102_444_800;

/// Successor computation over a task's firing grid.
///
/// The engine only ever asks for the instant following a given one; the
/// grid itself belongs to the parser collaborator. The default grid is UTC
/// cron via [`UtcCronParser`].
pub trait FiringSchedule: Send + Sync {
    /// Least firing instant strictly greater than `t`, truncated to whole
    /// seconds. `None` when the schedule yields nothing before the horizon.
    fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Turns a cron expression into a [`FiringSchedule`].
///
/// Installed at construction; each registered task owns the schedule the
/// parser handed back for it.
pub trait CronParser: Send + Sync {
    fn parse(&self, expr: &str) -> Result<Arc<dyn FiringSchedule>, SchedulerError>;
}

/// Default parser: UTC cron as accepted by the `cron` crate, with 5-field
/// normalization.
#[derive(Debug, Default, Clone, Copy)]
pub struct UtcCronParser;

impl CronParser for UtcCronParser {
    fn parse(&self, expr: &str) -> Result<Arc<dyn FiringSchedule>, SchedulerError> {
        Ok(Arc::new(CronSchedule::parse(expr)?))
    }
}

/// A parsed UTC cron schedule.
#[derive(Debug, Clone)]
pub(crate) struct CronSchedule {
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse a cron expression, normalizing 5-field input to the 6-field
    /// form the `cron` crate expects.
    pub(crate) fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let normalized = normalize_cron(expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|source| SchedulerError::InvalidCron {
                expr: expr.to_string(),
                source,
            })?;
        Ok(Self { schedule })
    }
}

impl FiringSchedule for CronSchedule {
    fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.schedule.after(&t).next()?;
        let next = DateTime::from_timestamp(next.timestamp(), 0)?;
        (next.timestamp() < HORIZON_UNIX).then_some(next)
    }
}

/// Normalize a 5-field cron expression to 6-field by prepending a seconds
/// column.
///
/// The `cron` crate requires 6 fields: `sec min hour day-of-month month
/// day-of-week`. Callers write standard 5-field cron; 6- and 7-field
/// (year-qualified) expressions pass through as-is.
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    let field_count = trimmed.split_whitespace().count();
    if field_count == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn normalize_cron_5_to_6_fields() {
        assert_eq!(normalize_cron("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_cron("0 6 * * 1-5"), "0 0 6 * * 1-5");
    }

    #[test]
    fn normalize_cron_passes_6_fields_through() {
        assert_eq!(normalize_cron("0 */15 * * * *"), "0 */15 * * * *");
    }

    #[test]
    fn normalize_cron_trims_whitespace() {
        assert_eq!(normalize_cron("  */5 * * * *  "), "0 */5 * * * *");
    }

    #[test]
    fn parse_rejects_malformed_expression() {
        assert!(CronSchedule::parse("not a cron").is_err());
    }

    #[test]
    fn next_after_is_strictly_greater() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        let next = cron.next_after(utc("2024-01-01T00:01:00Z")).unwrap();
        assert_eq!(next, utc("2024-01-01T00:02:00Z"));
    }

    #[test]
    fn next_after_from_mid_minute() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        let next = cron.next_after(utc("2024-01-01T00:00:30Z")).unwrap();
        assert_eq!(next, utc("2024-01-01T00:01:00Z"));
    }

    #[test]
    fn next_after_exhausted_year_yields_none() {
        // Year-qualified schedule with no instant after its last firing.
        let cron = CronSchedule::parse("0 0 0 1 1 * 2024").unwrap();
        assert!(cron.next_after(utc("2024-06-01T00:00:00Z")).is_none());
    }

    #[test]
    fn next_after_at_horizon_yields_none() {
        // 2100-01-01T00:00:00Z is the first excluded instant.
        let cron = CronSchedule::parse("0 0 0 1 1 * 2100").unwrap();
        assert!(cron.next_after(utc("2024-01-01T00:00:00Z")).is_none());
    }

    #[test]
    fn next_after_just_inside_horizon_is_kept() {
        let cron = CronSchedule::parse("0 0 0 31 12 * 2099").unwrap();
        let next = cron.next_after(utc("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2099-12-31T00:00:00Z"));
    }
}
