// Lorekeep Runtime — Cron Matching
//
// Five-field cron expressions matched at minute granularity via the `cron`
// crate (which internally wants a seconds field — we pin it to 0). The
// tick loop re-reads the wall clock every iteration, so a delayed wakeup
// after OS sleep still evaluates against real time; the minute key guards
// double fires and catch-up covers long gaps.

use chrono::{DateTime, Duration, Timelike, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Normalize a five-field expression to the six fields the parser wants.
fn normalize(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_cron(expr: &str) -> Option<Schedule> {
    Schedule::from_str(&normalize(expr)).ok()
}

/// Truncate to the start of the minute.
pub fn minute_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// The double-fire guard key: `YYYY-MM-DDTHH:MM`.
pub fn minute_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M").to_string()
}

/// Does `expr` match the minute containing `now`?
pub fn matches_cron(expr: &str, now: DateTime<Utc>) -> bool {
    let Some(schedule) = parse_cron(expr) else { return false };
    schedule.includes(minute_start(now))
}

/// The most recent match of `expr` at or before `now`, searching back at
/// most `lookback_days`. Used by catch-up on engine start.
pub fn last_cron_match(
    expr: &str,
    now: DateTime<Utc>,
    lookback_days: i64,
) -> Option<DateTime<Utc>> {
    let schedule = parse_cron(expr)?;
    let start = now - Duration::days(lookback_days);
    schedule
        .after(&start)
        .take_while(|t| *t <= now)
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn five_field_expressions_parse() {
        assert!(parse_cron("0 9 * * *").is_some());
        assert!(parse_cron("*/5 * * * *").is_some());
        assert!(parse_cron("not a cron").is_none());
    }

    #[test]
    fn matches_within_the_minute() {
        // 09:00 daily matches any second within 09:00.
        assert!(matches_cron("0 9 * * *", at(2025, 6, 15, 9, 0, 0)));
        assert!(matches_cron("0 9 * * *", at(2025, 6, 15, 9, 0, 42)));
        assert!(!matches_cron("0 9 * * *", at(2025, 6, 15, 9, 1, 0)));
        assert!(!matches_cron("0 9 * * *", at(2025, 6, 15, 8, 59, 59)));
    }

    #[test]
    fn minute_key_format() {
        assert_eq!(minute_key(at(2025, 6, 15, 10, 0, 30)), "2025-06-15T10:00");
    }

    #[test]
    fn last_match_finds_this_morning() {
        // Engine starts at 09:05; the 09:00 match is five minutes back.
        let now = at(2025, 6, 15, 9, 5, 0);
        let last = last_cron_match("0 9 * * *", now, 7).unwrap();
        assert_eq!(last, at(2025, 6, 15, 9, 0, 0));
    }

    #[test]
    fn last_match_crosses_days() {
        // Starting at 08:00, the most recent 09:00 match was yesterday.
        let now = at(2025, 6, 15, 8, 0, 0);
        let last = last_cron_match("0 9 * * *", now, 7).unwrap();
        assert_eq!(last, at(2025, 6, 14, 9, 0, 0));
    }

    #[test]
    fn last_match_respects_lookback() {
        // A yearly expression with a 7-day lookback finds nothing.
        let now = at(2025, 6, 15, 0, 0, 0);
        assert!(last_cron_match("0 0 1 1 *", now, 7).is_none());
    }
}
