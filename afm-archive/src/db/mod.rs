//! Catalog queries
//!
//! Free functions over the shared `SqlitePool`, one module per table.
//! Timestamps are stored as RFC 3339 UTC strings with millisecond precision
//! so that string order equals time order.

pub mod frames;
pub mod mappings;
pub mod masters;
pub mod sessions;
pub mod tiers;
pub mod variable_stars;

use crate::error::{ArchiveError, ArchiveResult};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Canonical stored form of a timestamp
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp; also accepts SQLite's `CURRENT_TIMESTAMP` form
pub fn parse_ts(value: &str) -> ArchiveResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| ArchiveError::InvalidInput(format!("unreadable timestamp '{}'", value)))
}

/// Empty strings come from column sync defaults on legacy rows
pub fn parse_opt_ts(value: Option<String>) -> ArchiveResult<Option<DateTime<Utc>>> {
    match value {
        Some(v) if !v.trim().is_empty() => parse_ts(&v).map(Some),
        _ => Ok(None),
    }
}
