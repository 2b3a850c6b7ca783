//! Parsing for the two time shapes the CLI accepts.
//!
//! Durations use the compact `NwNdNhNmNs` syntax: each segment optional, each
//! unit at most once, values non-negative integers. Times are either an
//! ISO-local clock time (`HH:MM[:SS]`, meaning today at that time) or a full
//! date/datetime.

use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::JobmanError;

const SECS_PER: [(char, u64); 5] = [
    ('w', 7 * 24 * 3600),
    ('d', 24 * 3600),
    ('h', 3600),
    ('m', 60),
    ('s', 1),
];

/// Parse a `NwNdNhNmNs` duration. The empty string parses to zero.
pub fn parse_duration(input: &str) -> Result<Duration, JobmanError> {
    let mut seen = [false; 5];
    let mut total: u64 = 0;
    let mut digits = String::new();

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch.is_ascii_whitespace() && digits.is_empty() {
            continue;
        }
        let Some(unit) = SECS_PER.iter().position(|(u, _)| *u == ch) else {
            return Err(JobmanError::Usage(format!(
                "Can't convert '{input}' to a duration. Got uninterpretable character '{ch}'"
            )));
        };
        if digits.is_empty() {
            return Err(JobmanError::Usage(format!(
                "Can't convert '{input}' to a duration. Unit '{ch}' has no value"
            )));
        }
        if seen[unit] {
            return Err(JobmanError::Usage(format!(
                "Can't convert '{input}' to a duration. Got multiple values for '{ch}'"
            )));
        }
        seen[unit] = true;
        let value: u64 = digits.parse().map_err(|_| {
            JobmanError::Usage(format!(
                "Can't convert '{input}' to a duration. '{digits}' must be an integer"
            ))
        })?;
        total += value * SECS_PER[unit].1;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(JobmanError::Usage(format!(
            "Can't convert '{input}' to a duration. Trailing value '{digits}' has no unit"
        )));
    }

    Ok(Duration::from_secs(total))
}

/// Parse `HH:MM[:SS]` as today at that time, or a full date/datetime.
pub fn parse_time_or_datetime(input: &str) -> Result<NaiveDateTime, JobmanError> {
    let input = input.trim();

    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(tm) = NaiveTime::parse_from_str(input, fmt) {
            return Ok(Local::now().date_naive().and_time(tm));
        }
    }

    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(dt);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }

    Err(JobmanError::Usage(format!(
        "Can't interpret '{input}' as a time or datetime"
    )))
}

/// `t + d`, saturating at the far end of the calendar instead of panicking.
pub fn after(t: NaiveDateTime, d: Duration) -> NaiveDateTime {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|cd| t.checked_add_signed(cd))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Local wall-clock time, naive (the store holds local timestamps).
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
