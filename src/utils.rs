use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;

use crate::types::{SdkError, SdkResult};

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Parse a `datetime-local` style timestamp e.g. `2025-01-01T10:00` or `2025-01-01T10:00:30`
pub fn parse_schedule_time(value: &str) -> SdkResult<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| SdkError::InvalidDraft("timestamp must look like YYYY-MM-DDTHH:MM"))
}

/// Seconds between `start` and `end`, negative if `end` is first
pub fn schedule_duration(start: &NaiveDateTime, end: &NaiveDateTime) -> i64 {
    (*end - *start).num_seconds()
}

/// Parse a JSON-RPC hex quantity e.g. `0xaa36a7`
pub fn parse_hex_quantity(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
}
