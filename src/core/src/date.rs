//! Calendar-day stamps used in file names (`YYYYMMDD`).

use chrono::{Local, NaiveDate};

use crate::error::{MirrorError, Result};

const STAMP_FORMAT: &str = "%Y%m%d";

/// Format a date as `YYYYMMDD`.
pub fn stamp(date: NaiveDate) -> String {
    date.format(STAMP_FORMAT).to_string()
}

/// Parse a `YYYYMMDD` stamp.
pub fn parse_stamp(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MirrorError::ConfigError(format!(
            "invalid date '{}', expected YYYYMMDD",
            s
        )));
    }
    NaiveDate::parse_from_str(s, STAMP_FORMAT)
        .map_err(|e| MirrorError::ConfigError(format!("invalid date '{}': {}", s, e)))
}

/// Today's date in local time.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}
