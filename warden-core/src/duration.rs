//! Duration strings used by workflow step `after` settings.
//!
//! Grammar: an optional sign followed by one or more `<integer><unit>`
//! segments, e.g. `"30s"`, `"10m"`, `"1h30m"`, `"7d"`. Units are `ms`, `s`,
//! `m`, `h` and `d`, case-insensitive. A bare integer means seconds.

use std::time::Duration;

use crate::error::WorkflowError;

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

fn invalid(value: &str, reason: &str) -> WorkflowError {
    WorkflowError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a duration string into signed milliseconds.
pub fn parse_duration_millis(value: &str) -> Result<i64, WorkflowError> {
    let trimmed = value.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    if body.is_empty() {
        return Err(invalid(value, "empty duration"));
    }

    let total = if body.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = body
            .parse()
            .map_err(|_| invalid(value, "number out of range"))?;
        secs.checked_mul(MS_PER_SECOND)
            .ok_or_else(|| invalid(value, "number out of range"))?
    } else {
        parse_segments(value, body)?
    };

    Ok(if negative { -total } else { total })
}

fn parse_segments(original: &str, body: &str) -> Result<i64, WorkflowError> {
    let lower = body.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut total: i64 = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        let digits_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == digits_start {
            return Err(invalid(original, "expected a number before the unit"));
        }
        let amount: i64 = lower[digits_start..pos]
            .parse()
            .map_err(|_| invalid(original, "number out of range"))?;

        let unit_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        let per_unit = match &lower[unit_start..pos] {
            "ms" => 1,
            "s" => MS_PER_SECOND,
            "m" => MS_PER_MINUTE,
            "h" => MS_PER_HOUR,
            "d" => MS_PER_DAY,
            "" => return Err(invalid(original, "missing unit")),
            _ => return Err(invalid(original, "unknown unit")),
        };

        total = amount
            .checked_mul(per_unit)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(|| invalid(original, "number out of range"))?;
    }

    Ok(total)
}

/// Parse an `after` value into a delay.
///
/// Zero and negative durations mean "run immediately" and yield `None`.
pub fn parse_delay(value: &str) -> Result<Option<Duration>, WorkflowError> {
    let millis = parse_duration_millis(value)?;
    if millis <= 0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_millis(millis as u64)))
    }
}
