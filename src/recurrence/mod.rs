//! Time & Recurrence Engine.
//!
//! Translates a job's schedule string into the next absolute wake-up
//! instant, deterministically offset per job. See [`hash`] for the
//! `H`/`R` token expansion kept separate from iteration below.

mod hash;

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;

use crate::error::RecurrenceError;

pub use hash::{expand, sub_second_offset};

/// Reorder the spec's field order (minute hour dom month dow second) into
/// the `cron` crate's expected order (sec min hour dom month dow).
fn to_cron_crate_order(expanded: &str) -> String {
    let f: Vec<&str> = expanded.split_whitespace().collect();
    debug_assert_eq!(f.len(), 6);
    format!("{} {} {} {} {} {}", f[5], f[0], f[1], f[2], f[3], f[4])
}

/// `Next(schedule, name, after) -> instant | none`.
///
/// Returns `Ok(None)` only when the underlying rule has no future
/// occurrence (possible only for a bounded `RRULE`). Deterministic given
/// `(schedule, name, after)` except where `R` tokens are present.
pub fn next(
    schedule: &str,
    name: &str,
    timezone: &chrono_tz::Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    let schedule = schedule.trim();
    let base = if let Some(rule) = schedule.strip_prefix("RRULE:") {
        next_rrule(rule, name, after)?
    } else {
        next_cron(schedule, name, timezone, after)?
    };

    Ok(base.map(|instant| {
        let offset_ms = (sub_second_offset(name) * 1000.0) as i64;
        instant + ChronoDuration::milliseconds(offset_ms)
    }))
}

fn next_cron(
    schedule: &str,
    name: &str,
    timezone: &chrono_tz::Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    let expanded = hash::expand(schedule, name)?;
    let cron_order = to_cron_crate_order(&expanded);
    let parsed = CronSchedule::from_str(&cron_order)
        .map_err(|e| RecurrenceError::InvalidExpression(cron_order.clone(), e.to_string()))?;

    let reference = after.with_timezone(timezone);
    Ok(parsed.after(&reference).next().map(|dt| dt.with_timezone(&Utc)))
}

fn next_rrule(rule: &str, name: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    let crc = crc32fast::hash(name.as_bytes());
    let backdate_secs = i64::from(crc % 86_400);
    let epoch = after.timestamp();
    let offset = epoch.rem_euclid(backdate_secs.max(1));
    let anchor = after - ChronoDuration::seconds(offset);

    let dtstart = anchor.format("%Y%m%dT%H%M%SZ").to_string();
    let text = format!("DTSTART:{}\nRRULE:{}", dtstart, rule);

    let set: rrule::RRuleSet = text
        .parse()
        .map_err(|e: rrule::RRuleError| RecurrenceError::InvalidExpression(rule.to_string(), e.to_string()))?;

    let after_utc = after.with_timezone(&rrule::Tz::UTC);
    let (occurrences, _limited) = set.after(after_utc).all(1);
    Ok(occurrences.into_iter().next().map(|dt| dt.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc_tz() -> chrono_tz::Tz {
        chrono_tz::UTC
    }

    #[test]
    fn hash_hourly_fixed_anchor() {
        // Scenario 1 from the testable-properties list: `H * * * *`
        // (a five-field "every hour at :H" schedule) for name "hello"
        // anchored at 2020-01-01T00:00:00 fires first at 00:10:00 exactly
        // (a five-field expression hashes no second, so the base instant
        // lands on second 0), plus the name's fixed sub-second offset, then
        // recurs hourly from there.
        let anchor = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let first = next("H * * * *", "hello", &utc_tz(), anchor)
            .unwrap()
            .expect("hourly schedule always has a next occurrence");
        let expected_base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 10, 0).unwrap();
        let expected_offset_ms = (sub_second_offset("hello") * 1000.0) as i64;
        assert_eq!(first, expected_base + ChronoDuration::milliseconds(expected_offset_ms));
        let second = next("H * * * *", "hello", &utc_tz(), first).unwrap().unwrap();
        assert_eq!(second - first, ChronoDuration::hours(1));
    }

    #[test]
    fn daily_alias_recurs_at_24h_interval() {
        let anchor = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let first = next("@daily", "hello", &utc_tz(), anchor).unwrap().unwrap();
        let second = next("@daily", "hello", &utc_tz(), first).unwrap().unwrap();
        assert_eq!(second - first, ChronoDuration::days(1));
    }

    #[test]
    fn deterministic_without_random_tokens() {
        let anchor = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let a = next("H H * * *", "svc-a", &utc_tz(), anchor).unwrap();
        let b = next("H H * * *", "svc-a", &utc_tz(), anchor).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn six_field_with_explicit_second_is_accepted() {
        let anchor = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        assert!(next("0 0 * * * *", "svc", &utc_tz(), anchor).unwrap().is_some());
    }
}
