//! Millisecond timestamps.
//!
//! Every timestamp that crosses a storage or wire boundary is truncated to
//! milliseconds. Both stores persist them as INTEGER Unix milliseconds, so
//! ordering in SQL and ordering in Rust always agree.

use chrono::{DateTime, SubsecRound, Utc};

use crate::error::{CoreError, CoreResult};

/// Current UTC time truncated to milliseconds.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Unix milliseconds for persistence.
#[inline]
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Inverse of [`to_millis`].
pub fn from_millis(ms: i64) -> CoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(CoreError::InvalidTimestamp(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_is_lossless_after_truncation() {
        let at = now();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
    }

    #[test]
    fn test_out_of_range_millis() {
        assert!(matches!(
            from_millis(i64::MAX),
            Err(CoreError::InvalidTimestamp(_))
        ));
    }
}
