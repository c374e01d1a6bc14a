//! Occurrence arithmetic for job schedules.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Error, Result};
use crate::model::job::JobSchedule;

/// Parse a cron expression. Five-field (minute-first) expressions get a
/// leading seconds field of `0`; six and seven fields are taken as-is.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_string(),
        n => {
            return Err(Error::Validation(format!(
                "cron expression '{expression}' has {n} fields, expected 5, 6 or 7"
            )));
        }
    };
    normalized
        .parse()
        .map_err(|e| Error::Validation(format!("invalid cron expression '{expression}': {e}")))
}

/// IANA timezone name, UTC when absent.
pub fn parse_timezone(name: Option<&str>) -> Result<Tz> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| Error::Validation(format!("unknown timezone '{name}'"))),
    }
}

/// First cron occurrence strictly after `after`, evaluated in `tz`.
pub fn next_cron(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// First occurrence of `anchor + k * every` (k >= 1) strictly after `after`.
///
/// Occurrences sit on a fixed grid, so late or slow executions never shift
/// later ones.
pub fn next_interval(anchor: DateTime<Utc>, every: Duration, after: DateTime<Utc>) -> DateTime<Utc> {
    let step = every.num_milliseconds().max(1);
    let elapsed = (after - anchor).num_milliseconds();
    let k = if elapsed < 0 { 1 } else { elapsed / step + 1 };
    anchor + Duration::milliseconds(step * k)
}

/// When a job first becomes due.
pub fn first_run(
    schedule: &JobSchedule,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        JobSchedule::Once { at } => Ok(Some(*at)),
        JobSchedule::Interval { every_ms } => {
            Ok(Some(next_interval(anchor, interval(*every_ms)?, now)))
        }
        JobSchedule::Cron {
            expression,
            timezone,
        } => Ok(next_cron(
            &parse_cron(expression)?,
            parse_timezone(timezone.as_deref())?,
            now,
        )),
    }
}

/// When a job is next due after executing at `now`. `None` for one-time jobs.
pub fn following_run(
    schedule: &JobSchedule,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        JobSchedule::Once { .. } => Ok(None),
        JobSchedule::Interval { every_ms } => {
            Ok(Some(next_interval(anchor, interval(*every_ms)?, now)))
        }
        JobSchedule::Cron {
            expression,
            timezone,
        } => Ok(next_cron(
            &parse_cron(expression)?,
            parse_timezone(timezone.as_deref())?,
            now,
        )),
    }
}

/// Check a schedule without computing anything.
pub fn validate(schedule: &JobSchedule) -> Result<()> {
    match schedule {
        JobSchedule::Once { .. } => Ok(()),
        JobSchedule::Interval { every_ms } => interval(*every_ms).map(|_| ()),
        JobSchedule::Cron {
            expression,
            timezone,
        } => {
            parse_cron(expression)?;
            parse_timezone(timezone.as_deref())?;
            Ok(())
        }
    }
}

fn interval(every_ms: u64) -> Result<Duration> {
    if every_ms == 0 {
        return Err(Error::Validation("interval must be positive".into()));
    }
    i64::try_from(every_ms)
        .map(Duration::milliseconds)
        .map_err(|_| Error::Validation(format!("interval of {every_ms}ms is too large")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let schedule = parse_cron("*/15 * * * *").unwrap();
        let next = next_cron(&schedule, Tz::UTC, at(10, 7, 30)).unwrap();
        assert_eq!(next, at(10, 15, 0));
    }

    #[test]
    fn cron_respects_timezone() {
        // 09:00 in New York is 14:00 UTC in early March (EST, UTC-5).
        let schedule = parse_cron("0 9 * * *").unwrap();
        let tz = parse_timezone(Some("America/New_York")).unwrap();
        let next = next_cron(&schedule, tz, at(12, 0, 0)).unwrap();
        assert_eq!(next, at(14, 0, 0));
    }

    #[test]
    fn bad_cron_and_timezone_are_validation_errors() {
        assert!(matches!(parse_cron("* * *"), Err(Error::Validation(_))));
        assert!(matches!(parse_cron("x * * * *"), Err(Error::Validation(_))));
        assert!(matches!(
            parse_timezone(Some("Mars/Olympus")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn interval_stays_on_the_anchor_grid() {
        let anchor = at(10, 0, 0);
        let every = Duration::seconds(10);
        // Executed late, at 10:00:13.5: next is 10:00:20, not 10:00:23.5.
        let late = anchor + Duration::milliseconds(13_500);
        assert_eq!(next_interval(anchor, every, late), at(10, 0, 20));
        // Exactly on an occurrence: the next one.
        assert_eq!(next_interval(anchor, every, at(10, 0, 20)), at(10, 0, 30));
        // Missed occurrences are skipped, not replayed.
        assert_eq!(next_interval(anchor, every, at(10, 1, 5)), at(10, 1, 10));
    }

    #[test]
    fn one_time_jobs_have_no_follow_up() {
        let schedule = JobSchedule::Once { at: at(10, 0, 0) };
        assert_eq!(
            first_run(&schedule, at(9, 0, 0), at(9, 0, 0)).unwrap(),
            Some(at(10, 0, 0))
        );
        assert_eq!(following_run(&schedule, at(9, 0, 0), at(10, 0, 0)).unwrap(), None);
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(validate(&JobSchedule::Interval { every_ms: 0 }).is_err());
    }
}
