//! Cron evaluation in a schedule's own timezone.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),

    #[error("cron expression {0:?} has no upcoming fire time")]
    NoUpcoming(String),
}

fn invalid(expr: &str, reason: impl Into<String>) -> CronError {
    CronError::InvalidExpression {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Parse an IANA timezone name. Callers log the error and fall back to UTC.
pub fn parse_timezone(name: &str) -> Result<Tz, CronError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CronError::InvalidTimezone(String::new()));
    }
    name.parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(name.to_string()))
}

fn parse_day(token: &str, expr: &str) -> Result<u32, CronError> {
    if let Ok(n) = token.parse::<u32>() {
        return match n {
            0..=6 => Ok(n),
            7 => Ok(0),
            _ => Err(invalid(expr, format!("day-of-week {n} out of range"))),
        };
    }
    DAY_NAMES
        .iter()
        .position(|d| d.eq_ignore_ascii_case(token))
        .map(|i| i as u32)
        .ok_or_else(|| invalid(expr, format!("unknown day-of-week {token:?}")))
}

/// Rewrite a Unix day-of-week field (0-7, Sunday = 0 and 7) as day names.
fn translate_day_of_week(field: &str, expr: &str) -> Result<String, CronError> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step = step
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| invalid(expr, format!("bad step in {item:?}")))?;
                (base, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match base {
            "*" => (0, 6),
            _ => match base.split_once('-') {
                Some((a, b)) => {
                    let a = parse_day(a, expr)?;
                    // A range may end on 7 (Sunday).
                    let b = match b.parse::<u32>() {
                        Ok(7) => 7,
                        _ => parse_day(b, expr)?,
                    };
                    if a > b {
                        return Err(invalid(expr, format!("descending range {base:?}")));
                    }
                    (a, b)
                }
                None if step.is_some() => (parse_day(base, expr)?, 6),
                None => {
                    let d = parse_day(base, expr)?;
                    (d, d)
                }
            },
        };

        let mut d = start;
        while d <= end {
            days.insert(d % 7);
            d += step.unwrap_or(1);
        }
    }

    Ok(days
        .into_iter()
        .map(|d| DAY_NAMES[d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

/// A day field left open: `*`, `*/n` or `?`.
fn unrestricted(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

/// A parsed 5-field expression.
///
/// When both day-of-month and day-of-week are restricted, a day matching
/// either one fires, so the expression becomes two schedules.
#[derive(Debug, Clone)]
struct CronSchedule {
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expr,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }
        let [minute, hour, dom, month, dow] = [fields[0], fields[1], fields[2], fields[3], fields[4]];
        let dow = translate_day_of_week(dow, expr)?;

        let build = |dom: &str, dow: &str| {
            let extended = format!("0 {minute} {hour} {dom} {month} {dow} *");
            Schedule::from_str(&extended).map_err(|e| invalid(expr, e.to_string()))
        };

        let schedules = if unrestricted(dom) || unrestricted(&dow) {
            vec![build(dom, &dow)?]
        } else {
            vec![build(dom, "*")?, build("*", &dow)?]
        };
        Ok(Self { schedules })
    }

    fn next_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

/// Check an expression without evaluating it.
pub fn validate_cron_expression(expr: &str) -> Result<(), CronError> {
    CronSchedule::parse(expr).map(|_| ())
}

/// First fire time of `expr`, read in `tz`, strictly after `after`.
pub fn next_fire_after(expr: &str, tz: Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    let schedule = CronSchedule::parse(expr)?;
    schedule
        .next_after(&after.with_timezone(&tz))
        .map(|next| next.with_timezone(&Utc))
        .ok_or_else(|| CronError::NoUpcoming(expr.to_string()))
}

/// Decides whether a schedule entry is due at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronEvaluator {
    /// Scheduler tick interval; a missing last run counts as one tick ago.
    tick: Duration,
}

impl Default for CronEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl CronEvaluator {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Due iff the first fire time after `last_run` is not after `now`.
    ///
    /// An empty expression is never due. Without a last run only fire times
    /// inside the last tick count, so a cold cache does not fire every entry.
    pub fn due(
        &self,
        expr: &str,
        tz: Tz,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, CronError> {
        if expr.trim().is_empty() {
            return Ok(false);
        }

        let tick = chrono::Duration::from_std(self.tick).unwrap_or(chrono::Duration::seconds(60));
        let last = last_run.unwrap_or(now - tick);
        let next = next_fire_after(expr, tz, last)?;
        Ok(next <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn every_fifteen_minutes() {
        let next = next_fire_after("*/15 * * * *", Tz::UTC, utc(2026, 1, 19, 10, 32, 0)).unwrap();
        assert_eq!(next, utc(2026, 1, 19, 10, 45, 0));
    }

    #[test]
    fn daylight_saving_shifts_the_utc_instant() {
        let chicago = parse_timezone("America/Chicago").unwrap();

        // CST (UTC-6) before the 2026-03-08 transition, CDT (UTC-5) after.
        let before = next_fire_after("0 9 * * *", chicago, utc(2026, 3, 7, 0, 0, 0)).unwrap();
        let after = next_fire_after("0 9 * * *", chicago, utc(2026, 3, 9, 0, 0, 0)).unwrap();

        assert_eq!(before, utc(2026, 3, 7, 15, 0, 0));
        assert_eq!(after, utc(2026, 3, 9, 14, 0, 0));
    }

    #[test]
    fn unix_day_of_week_numbering() {
        // 2026-01-19 is a Monday.
        let monday = utc(2026, 1, 19, 12, 0, 0);
        assert_eq!(
            next_fire_after("0 9 * * 0", Tz::UTC, monday).unwrap(),
            utc(2026, 1, 25, 9, 0, 0)
        );
        assert_eq!(
            next_fire_after("0 9 * * 7", Tz::UTC, monday).unwrap(),
            utc(2026, 1, 25, 9, 0, 0)
        );
        assert_eq!(
            next_fire_after("0 9 * * 1-5", Tz::UTC, monday).unwrap(),
            utc(2026, 1, 20, 9, 0, 0)
        );
        assert_eq!(
            next_fire_after("0 9 * * 6-7", Tz::UTC, monday).unwrap(),
            utc(2026, 1, 24, 9, 0, 0)
        );
    }

    #[test]
    fn restricted_day_fields_fire_on_either_match() {
        // 2026-01-19 is a Monday; the 1st of February is a Sunday.
        let monday = utc(2026, 1, 19, 12, 0, 0);
        assert_eq!(
            next_fire_after("0 9 1 * 1", Tz::UTC, monday).unwrap(),
            utc(2026, 1, 26, 9, 0, 0)
        );
        assert_eq!(
            next_fire_after("0 9 1,15 * 1-5", Tz::UTC, utc(2026, 1, 30, 12, 0, 0)).unwrap(),
            utc(2026, 2, 1, 9, 0, 0)
        );
        // One open day field keeps plain intersection.
        assert_eq!(
            next_fire_after("0 9 */2 * 1", Tz::UTC, monday).unwrap(),
            utc(2026, 2, 9, 9, 0, 0)
        );
        assert_eq!(
            next_fire_after("0 9 15 * *", Tz::UTC, monday).unwrap(),
            utc(2026, 2, 15, 9, 0, 0)
        );
    }

    #[test]
    fn day_of_week_translation() {
        assert_eq!(translate_day_of_week("*", "").unwrap(), "*");
        assert_eq!(translate_day_of_week("0,7", "").unwrap(), "SUN");
        assert_eq!(translate_day_of_week("1-5", "").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(translate_day_of_week("*/2", "").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(translate_day_of_week("mon,Fri", "").unwrap(), "MON,FRI");
        assert!(translate_day_of_week("8", "").is_err());
        assert!(translate_day_of_week("5-1", "").is_err());
    }

    #[test]
    fn validation_uses_the_same_parser() {
        assert!(validate_cron_expression("0 9 * * 1-5").is_ok());
        assert!(validate_cron_expression("not a cron").is_err());
        assert!(validate_cron_expression("0 9 * *").is_err());
        assert!(validate_cron_expression("61 9 * * *").is_err());
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(parse_timezone("Europe/Berlin").unwrap(), Tz::Europe__Berlin);
        assert!(parse_timezone("").is_err());
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn empty_expression_is_never_due() {
        let eval = CronEvaluator::default();
        assert!(!eval.due("", Tz::UTC, None, Utc::now()).unwrap());
        assert!(!eval.due("   ", Tz::UTC, None, Utc::now()).unwrap());
    }

    #[test]
    fn due_after_last_run() {
        let eval = CronEvaluator::default();
        let now = utc(2026, 1, 19, 9, 0, 20);

        // Ran yesterday at 09:00; today's 09:00 has passed.
        assert!(eval.due("0 9 * * *", Tz::UTC, Some(utc(2026, 1, 18, 9, 0, 5)), now).unwrap());
        // Already ran today.
        assert!(!eval.due("0 9 * * *", Tz::UTC, Some(utc(2026, 1, 19, 9, 0, 1)), now).unwrap());
        assert!(eval.due("bogus", Tz::UTC, None, now).is_err());
    }

    #[test]
    fn cold_start_only_fires_inside_the_last_tick() {
        let eval = CronEvaluator::default();

        assert!(eval.due("0 9 * * *", Tz::UTC, None, utc(2026, 1, 19, 9, 0, 30)).unwrap());
        assert!(!eval.due("0 9 * * *", Tz::UTC, None, utc(2026, 1, 19, 9, 1, 30)).unwrap());
        assert!(!eval.due("0 9 * * *", Tz::UTC, None, utc(2026, 1, 19, 15, 0, 0)).unwrap());
    }

    #[test]
    fn every_minute_fires_once_per_minute_after_cold_start() {
        let eval = CronEvaluator::default();
        let first = utc(2026, 1, 19, 9, 0, 10);

        assert!(eval.due("* * * * *", Tz::UTC, None, first).unwrap());
        assert!(!eval.due("* * * * *", Tz::UTC, Some(first), first + chrono::Duration::seconds(30)).unwrap());
        assert!(eval.due("* * * * *", Tz::UTC, Some(first), first + chrono::Duration::seconds(60)).unwrap());
    }

    proptest! {
        #[test]
        fn every_minute_is_due_on_cold_start_and_not_again_that_minute(
            secs in 1_600_000_000i64..2_000_000_000i64,
        ) {
            use chrono::Timelike;

            let now = DateTime::from_timestamp(secs, 0).unwrap();
            let eval = CronEvaluator::default();
            prop_assert!(eval.due("* * * * *", Tz::UTC, None, now).unwrap());

            let same_minute = now.with_second(59).unwrap();
            prop_assert!(!eval.due("* * * * *", Tz::UTC, Some(now), same_minute).unwrap());
        }

        #[test]
        fn daily_schedule_cold_start_fires_only_at_its_minute(
            secs in 1_600_000_000i64..2_000_000_000i64,
            minute in 0u32..60,
            hour in 0u32..24,
        ) {
            use chrono::Timelike;

            let now = DateTime::from_timestamp(secs, 0).unwrap();
            let expr = format!("{minute} {hour} * * *");
            let eval = CronEvaluator::default();

            // (now - 60s, now] holds exactly one minute boundary.
            let boundary = now.with_second(0).unwrap();
            let expected = boundary.hour() == hour && boundary.minute() == minute;

            prop_assert_eq!(eval.due(&expr, Tz::UTC, None, now).unwrap(), expected);
        }
    }
}
