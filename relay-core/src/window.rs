//! Query time windows
//!
//! A window is a half-open `[from, to)` range in epoch milliseconds.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DEFAULT_WINDOW_HOURS;

/// Errors from building a window
#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("Invalid date \"{0}\" (expected YYYY-MM-DD or YYYY-MM-DD_HH:MM:SS)")]
    InvalidDate(String),

    #[error("Empty window: from {from} is not before to {to}")]
    Empty { from: i64, to: i64 },
}

/// A half-open millisecond interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl TimeWindow {
    pub fn new(from_ms: i64, to_ms: i64) -> Result<Self, WindowError> {
        if from_ms >= to_ms {
            return Err(WindowError::Empty { from: from_ms, to: to_ms });
        }
        Ok(Self { from_ms, to_ms })
    }

    /// The `hours` before `now`
    pub fn last_hours(hours: i64, now: DateTime<Utc>) -> Self {
        let from = now - Duration::hours(hours);
        Self {
            from_ms: from.timestamp_millis(),
            to_ms: now.timestamp_millis(),
        }
    }

    /// The `days` before `now`
    pub fn last_days(days: i64, now: DateTime<Utc>) -> Self {
        Self::last_hours(days * 24, now)
    }

    /// Build a window from optional CLI-style bounds.
    ///
    /// `last_days` wins over explicit bounds. A missing `from` defaults to 24h
    /// before `now`; a missing `to` defaults to `now`.
    pub fn resolve(
        from: Option<&str>,
        to: Option<&str>,
        last_days: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Self, WindowError> {
        if let Some(days) = last_days {
            return Ok(Self::last_days(i64::from(days), now));
        }
        let from = match from {
            Some(raw) => parse_utc(raw)?,
            None => now - Duration::hours(DEFAULT_WINDOW_HOURS),
        };
        let to = match to {
            Some(raw) => parse_utc(raw)?,
            None => now,
        };
        Self::new(from.timestamp_millis(), to.timestamp_millis())
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.from_ms && ts_ms < self.to_ms
    }

    /// Lower bound in epoch seconds, for feeds that work in seconds
    pub fn from_secs(&self) -> i64 {
        self.from_ms / 1000
    }

    pub fn to_secs(&self) -> i64 {
        self.to_ms / 1000
    }

    pub fn from_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.from_ms).single().unwrap_or_default()
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.to_ms).single().unwrap_or_default()
    }
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DD_HH:MM:SS` as a UTC instant
pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>, WindowError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d_%H:%M:%S")
        .map(|dt| Utc.from_utc_datetime(&dt))
        .map_err(|_| WindowError::InvalidDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_default_is_last_24_hours() {
        let window = TimeWindow::resolve(None, None, None, now()).unwrap();
        assert_eq!(window.to_ms - window.from_ms, 24 * 3600 * 1000);
        assert_eq!(window.to_ms, now().timestamp_millis());
    }

    #[test]
    fn test_parse_both_formats() {
        let day = parse_utc("2024-03-01").unwrap();
        assert_eq!(day, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        let ts = parse_utc("2024-03-01_06:30:15").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 15).unwrap());
    }

    #[test]
    fn test_invalid_date_is_reported() {
        let err = TimeWindow::resolve(Some("03/01/2024"), None, None, now()).unwrap_err();
        assert_eq!(err, WindowError::InvalidDate("03/01/2024".to_string()));
    }

    #[test]
    fn test_last_days_overrides_bounds() {
        let window = TimeWindow::resolve(Some("2020-01-01"), None, Some(3), now()).unwrap();
        assert_eq!(window.to_ms - window.from_ms, 3 * 24 * 3600 * 1000);
    }

    #[test]
    fn test_inverted_window_rejected() {
        let result = TimeWindow::resolve(Some("2024-03-05"), Some("2024-03-01"), None, now());
        assert!(matches!(result, Err(WindowError::Empty { .. })));
    }

    #[test]
    fn test_half_open() {
        let window = TimeWindow::new(1000, 2000).unwrap();
        assert!(window.contains(1000));
        assert!(window.contains(1999));
        assert!(!window.contains(2000));
    }
}
