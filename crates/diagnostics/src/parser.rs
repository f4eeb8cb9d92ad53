//! Turns raw log lines into [`LogEntry`] values.
//!
//! Accepted shapes, tried in order: logcat `threadtime`, logcat `time`,
//! logcat `brief`, kernel `[ secs.micros] msg`. Anything else is kept whole
//! as an `Info` message tagged `unknown`.

use dsu_core::{LogEntry, LogSeverity};
use once_cell::sync::Lazy;
use regex::Regex;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

static THREADTIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{2})-(\d{2})\s+(\d{2}):(\d{2}):(\d{2})\.(\d{3})\s+\d+\s+\d+\s+([VDIWEFA])\s+(.*?)\s*:\s?(.*)$",
    )
    .expect("threadtime pattern")
});

static TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{2})-(\d{2})\s+(\d{2}):(\d{2}):(\d{2})\.(\d{3})\s+([VDIWEFA])/(.*?)\s*(?:\(\s*\d+\))?:\s?(.*)$",
    )
    .expect("time pattern")
});

static BRIEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([VDIWEFA])/(.*?)\s*(?:\(\s*\d+\))?:\s?(.*)$").expect("brief pattern")
});

static KERNEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\s*\d+\.\d+\]\s?(.*)$").expect("kernel pattern"));

const UNKNOWN_TAG: &str = "unknown";
const KERNEL_TAG: &str = "kernel";

/// Parses one line. `received_millis` stamps lines without a usable
/// timestamp and supplies the year for logcat timestamps, which carry none.
pub fn parse_line(line: &str, source: &str, received_millis: i64) -> LogEntry {
    let line = line.trim_end_matches(['\r', '\n']);

    for pattern in [&*THREADTIME, &*TIME] {
        if let Some(caps) = pattern.captures(line) {
            let field = |index: usize| caps.get(index).map(|m| m.as_str()).unwrap_or("");
            let timestamp = logcat_timestamp(
                [field(1), field(2), field(3), field(4), field(5), field(6)],
                received_millis,
            )
            .unwrap_or(received_millis);
            return entry(timestamp, field(7), field(8), field(9), source);
        }
    }

    if let Some(caps) = BRIEF.captures(line) {
        let field = |index: usize| caps.get(index).map(|m| m.as_str()).unwrap_or("");
        return entry(received_millis, field(1), field(2), field(3), source);
    }

    if let Some(caps) = KERNEL.captures(line) {
        let message = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        return LogEntry {
            timestamp_millis: received_millis,
            severity: LogSeverity::Info,
            tag: KERNEL_TAG.to_string(),
            message: message.to_string(),
            source: source.to_string(),
        };
    }

    LogEntry {
        timestamp_millis: received_millis,
        severity: LogSeverity::Info,
        tag: UNKNOWN_TAG.to_string(),
        message: line.to_string(),
        source: source.to_string(),
    }
}

fn entry(timestamp: i64, letter: &str, tag: &str, message: &str, source: &str) -> LogEntry {
    let severity = letter
        .chars()
        .next()
        .and_then(LogSeverity::from_letter)
        .unwrap_or(LogSeverity::Info);
    let tag = tag.trim();
    LogEntry {
        timestamp_millis: timestamp,
        severity,
        tag: if tag.is_empty() { UNKNOWN_TAG } else { tag }.to_string(),
        message: message.to_string(),
        source: source.to_string(),
    }
}

/// `MM-DD HH:MM:SS.mmm` in UTC, in the year of `received_millis`.
fn logcat_timestamp(fields: [&str; 6], received_millis: i64) -> Option<i64> {
    let [month, day, hour, minute, second, millis] = fields;
    let year = OffsetDateTime::from_unix_timestamp_nanos(received_millis as i128 * 1_000_000)
        .ok()?
        .year();
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    let date = Date::from_calendar_date(year, month, day.parse().ok()?).ok()?;
    let time = Time::from_hms_milli(
        hour.parse().ok()?,
        minute.parse().ok()?,
        second.parse().ok()?,
        millis.parse().ok()?,
    )
    .ok()?;
    let nanos = PrimitiveDateTime::new(date, time)
        .assume_utc()
        .unix_timestamp_nanos();
    Some((nanos / 1_000_000) as i64)
}
