use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

use crate::error::{Result, ScheduleError};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a reference-time override: `@<epoch seconds>` or
/// `YYYY-MM-DD HH:MM:SS` in local time.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Local>> {
    let invalid = || ScheduleError::InvalidTimestamp(s.to_string());

    if let Some(epoch) = s.strip_prefix('@') {
        let secs: i64 = epoch.parse().map_err(|_| invalid())?;
        return Local.timestamp_opt(secs, 0).single().ok_or_else(invalid);
    }

    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map_err(|_| invalid())?;
    // Ambiguous local times (DST fall-back) resolve to the earlier instant.
    Local.from_local_datetime(&naive).earliest().ok_or_else(invalid)
}
