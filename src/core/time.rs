//! Shared timestamp and id helpers for deterministic envelopes.

use chrono::{SecondsFormat, Utc};
use ulid::Ulid;

/// Returns the current time as ISO-8601 UTC (e.g. `2026-08-01T12:00:00.123456Z`).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Nanoseconds since the unix epoch; used for collision-free snapshot ids.
pub fn now_nanos() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso_is_utc() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_now_iso_sortable() {
        let a = now_iso();
        let b = now_iso();
        assert!(a <= b);
    }

    #[test]
    fn test_new_event_id_is_unique() {
        assert_ne!(new_event_id(), new_event_id());
    }

    #[test]
    fn test_new_event_id_is_valid_ulid() {
        assert!(Ulid::from_string(&new_event_id()).is_ok());
    }
}
