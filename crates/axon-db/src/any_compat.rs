//! Conversions for types the `sqlx` Any driver cannot decode natively.
//!
//! The Any driver only decodes integers, floats, strings and byte arrays
//! on both backends, so anything richer has to round-trip through one of
//! those. Timestamps are stored as `BIGINT` milliseconds since the Unix
//! epoch, which both PostgreSQL and SQLite compare and index correctly.

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;

/// Current wall-clock time as epoch milliseconds, ready to bind.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// `None` when the value is outside chrono's representable range.
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Decode a non-null `BIGINT` millisecond column into a [`DateTime`].
pub fn get_millis_datetime(row: &AnyRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let ms: i64 = row.try_get(column)?;
    from_millis(ms).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.into(),
        source: format!("timestamp {ms}ms is out of range").into(),
    })
}

/// Decode a nullable `BIGINT` millisecond column.
pub fn get_opt_millis_datetime(
    row: &AnyRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let ms: Option<i64> = row.try_get(column)?;
    match ms {
        None => Ok(None),
        Some(ms) => from_millis(ms)
            .map(Some)
            .ok_or_else(|| sqlx::Error::ColumnDecode {
                index: column.into(),
                source: format!("timestamp {ms}ms is out of range").into(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn millis_round_trip() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 45).unwrap();
        assert_eq!(from_millis(to_millis(ts)), Some(ts));
    }

    #[test]
    fn sub_millisecond_precision_is_truncated() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let round_tripped = from_millis(to_millis(ts)).unwrap();
        assert_eq!(round_tripped.timestamp_subsec_millis(), 123);
        assert_eq!(round_tripped.timestamp(), ts.timestamp());
    }

    #[test]
    fn out_of_range_millis_is_none() {
        assert!(from_millis(i64::MAX).is_none());
    }
}
