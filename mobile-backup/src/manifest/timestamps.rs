//! Timestamp handling for file records.
//!
//! Legacy `Manifest.mbdb` records carry three 32-bit timestamps. In on-disk
//! order they are the modification time, the change time and the creation
//! (birth) time. [`legacy_timestamps`] applies that mapping; every legacy
//! record goes through it.

use chrono::{DateTime, Utc};

/// Semantic timestamps of a file record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub btime: DateTime<Utc>,
}

/// Map the three raw legacy timestamps, in on-disk order, to their meaning.
pub fn legacy_timestamps(raw: [i64; 3]) -> Timestamps {
    let [first, second, third] = raw;
    Timestamps {
        mtime: utc_from_secs(first),
        ctime: utc_from_secs(second),
        btime: utc_from_secs(third),
    }
}

/// UTC instant from whole seconds since the Unix epoch.
///
/// Values chrono cannot represent collapse to the epoch.
pub fn utc_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// UTC instant from fractional seconds since the Unix epoch.
pub fn utc_from_fractional(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return DateTime::default();
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos).unwrap_or_default()
}
