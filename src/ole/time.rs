//! FILETIME conversion
//!
//! Directory timestamps are Windows FILETIME values: 100-nanosecond ticks
//! since 1601-01-01 UTC. Zero means "not set".

use chrono::{DateTime, Utc};

/// Ticks between 1601-01-01 and the Unix epoch
const UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Current time as a FILETIME
pub(crate) fn filetime_now() -> u64 {
    to_filetime(Utc::now())
}

/// Convert a UTC timestamp into a FILETIME. Times before 1601 clamp to zero.
pub(crate) fn to_filetime(time: DateTime<Utc>) -> u64 {
    let ticks = time
        .timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(i64::from(time.timestamp_subsec_nanos() / 100))
        .saturating_add(UNIX_EPOCH_TICKS);
    u64::try_from(ticks).unwrap_or(0)
}

/// Convert a FILETIME into a UTC timestamp; `None` for unset values
pub(crate) fn from_filetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let ticks = i64::try_from(filetime).ok()? - UNIX_EPOCH_TICKS;
    let seconds = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unix_epoch() {
        let epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(to_filetime(epoch), 116_444_736_000_000_000);
        assert_eq!(from_filetime(116_444_736_000_000_000), Some(epoch));
    }

    #[test]
    fn test_unset_and_early_dates() {
        assert_eq!(from_filetime(0), None);
        let early = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(to_filetime(early), 0);
        // Dates before 1970 still convert
        assert!(from_filetime(1).is_some());
    }

    #[test]
    fn test_now_is_recent() {
        let now = filetime_now();
        let back = from_filetime(now).unwrap();
        assert!((Utc::now() - back).num_seconds().abs() < 5);
    }
}
