//! Per-destination retry bookkeeping.
//!
//! One row per destination that has ever failed (or been attempted):
//! consecutive failure count, the earliest next attempt time, and the
//! blacklist flag. The flag is plain persistent state, so it survives
//! restarts; policy around when to set or clear it lives upstream.
//!
//! The flag is stored as `BIGINT` 0/1: the Any driver cannot decode a
//! sqlite `BOOLEAN` column.

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{Any, AnyConnection, AnyPool, Executor, FromRow, Row};

use crate::any_compat;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS destination_ledger (
    destination TEXT PRIMARY KEY,
    failure_count BIGINT NOT NULL DEFAULT 0,
    next_retry_at BIGINT,
    last_attempt_at BIGINT,
    blacklisted BIGINT NOT NULL DEFAULT 0
);
"#;

#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub destination: String,
    pub failure_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub blacklisted: bool,
}

impl<'r> FromRow<'r, AnyRow> for LedgerRow {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            destination: row.try_get("destination")?,
            failure_count: row.try_get("failure_count")?,
            next_retry_at: any_compat::get_opt_millis_datetime(row, "next_retry_at")?,
            last_attempt_at: any_compat::get_opt_millis_datetime(row, "last_attempt_at")?,
            blacklisted: row.try_get::<i64, _>("blacklisted")? != 0,
        })
    }
}

/// Generic over the executor so callers inside a write transaction read
/// their own uncommitted state.
pub async fn get<'e, E>(executor: E, destination: &str) -> Result<Option<LedgerRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any>,
{
    let row = sqlx::query(
        "SELECT destination, failure_count, next_retry_at, last_attempt_at, blacklisted \
         FROM destination_ledger WHERE destination = $1",
    )
    .bind(destination)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(LedgerRow::from_row).transpose()
}

/// Record a failed attempt: full-row upsert with the caller-computed
/// failure count, retry time and blacklist flag.
pub async fn upsert_failure(
    conn: &mut AnyConnection,
    destination: &str,
    failure_count: i64,
    next_retry_at: i64,
    last_attempt_at: i64,
    blacklisted: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO destination_ledger \
             (destination, failure_count, next_retry_at, last_attempt_at, blacklisted) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (destination) DO UPDATE SET \
             failure_count = EXCLUDED.failure_count, \
             next_retry_at = EXCLUDED.next_retry_at, \
             last_attempt_at = EXCLUDED.last_attempt_at, \
             blacklisted = EXCLUDED.blacklisted",
    )
    .bind(destination)
    .bind(failure_count)
    .bind(next_retry_at)
    .bind(last_attempt_at)
    .bind(i64::from(blacklisted))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record a successful attempt: failure count and retry time reset, the
/// blacklist flag deliberately untouched.
pub async fn reset_success(
    conn: &mut AnyConnection,
    destination: &str,
    last_attempt_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO destination_ledger \
             (destination, failure_count, next_retry_at, last_attempt_at, blacklisted) \
         VALUES ($1, 0, NULL, $2, 0) \
         ON CONFLICT (destination) DO UPDATE SET \
             failure_count = 0, \
             next_retry_at = NULL, \
             last_attempt_at = EXCLUDED.last_attempt_at",
    )
    .bind(destination)
    .bind(last_attempt_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Reset the row entirely, blacklist flag included.
pub async fn clear(conn: &mut AnyConnection, destination: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO destination_ledger \
             (destination, failure_count, next_retry_at, last_attempt_at, blacklisted) \
         VALUES ($1, 0, NULL, NULL, 0) \
         ON CONFLICT (destination) DO UPDATE SET \
             failure_count = 0, \
             next_retry_at = NULL, \
             blacklisted = 0",
    )
    .bind(destination)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Destinations with no ledger row have never failed: not blacklisted.
pub async fn is_blacklisted(pool: &AnyPool, destination: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT blacklisted FROM destination_ledger WHERE destination = $1")
        .bind(destination)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(row.try_get::<i64, _>("blacklisted")? != 0),
        None => Ok(false),
    }
}

pub async fn list_blacklisted(pool: &AnyPool) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query("SELECT destination FROM destination_ledger WHERE blacklisted <> 0")
        .fetch_all(pool)
        .await?;
    rows.iter().map(|r| r.try_get("destination")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect in-memory sqlite");
        sqlx::raw_sql(SCHEMA).execute(&pool).await.expect("create schema");
        pool
    }

    #[tokio::test]
    async fn unknown_destination_is_clean() {
        let pool = test_pool().await;
        assert!(get(&pool, "remote.example").await.expect("get").is_none());
        assert!(!is_blacklisted(&pool, "remote.example").await.expect("flag"));
    }

    #[tokio::test]
    async fn failure_upsert_round_trips() {
        let pool = test_pool().await;
        let mut txn = pool.begin().await.expect("begin");
        upsert_failure(&mut txn, "remote.example", 3, 120_000, 100_000, false)
            .await
            .expect("upsert");
        txn.commit().await.expect("commit");

        let row = get(&pool, "remote.example").await.expect("get").expect("row");
        assert_eq!(row.failure_count, 3);
        assert_eq!(row.next_retry_at.expect("retry").timestamp_millis(), 120_000);
        assert_eq!(row.last_attempt_at.expect("attempt").timestamp_millis(), 100_000);
        assert!(!row.blacklisted);
    }

    #[tokio::test]
    async fn success_resets_counters_but_not_blacklist() {
        let pool = test_pool().await;
        let mut txn = pool.begin().await.expect("begin");
        upsert_failure(&mut txn, "remote.example", 16, 500_000, 400_000, true)
            .await
            .expect("upsert");
        reset_success(&mut txn, "remote.example", 600_000).await.expect("reset");
        txn.commit().await.expect("commit");

        let row = get(&pool, "remote.example").await.expect("get").expect("row");
        assert_eq!(row.failure_count, 0);
        assert!(row.next_retry_at.is_none());
        assert_eq!(row.last_attempt_at.expect("attempt").timestamp_millis(), 600_000);
        assert!(row.blacklisted, "success must not clear the blacklist");
    }

    #[tokio::test]
    async fn clear_resets_the_blacklist() {
        let pool = test_pool().await;
        let mut txn = pool.begin().await.expect("begin");
        upsert_failure(&mut txn, "remote.example", 16, 500_000, 400_000, true)
            .await
            .expect("upsert");
        clear(&mut txn, "remote.example").await.expect("clear");
        txn.commit().await.expect("commit");

        let row = get(&pool, "remote.example").await.expect("get").expect("row");
        assert_eq!(row.failure_count, 0);
        assert!(row.next_retry_at.is_none());
        assert!(!row.blacklisted);
        assert!(list_blacklisted(&pool).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn blacklisted_destinations_are_listed() {
        let pool = test_pool().await;
        let mut txn = pool.begin().await.expect("begin");
        upsert_failure(&mut txn, "bad.example", 16, 1_000, 500, true).await.expect("bad");
        upsert_failure(&mut txn, "slow.example", 2, 1_000, 500, false).await.expect("slow");
        txn.commit().await.expect("commit");

        assert_eq!(list_blacklisted(&pool).await.expect("list"), vec!["bad.example"]);
        assert!(is_blacklisted(&pool, "bad.example").await.expect("flag"));
        assert!(!is_blacklisted(&pool, "slow.example").await.expect("flag"));
    }

    #[tokio::test]
    async fn blacklist_flag_round_trips_through_the_any_driver() {
        // The Any driver has no decode for a sqlite BOOLEAN column, so
        // the flag must live in the schema as an integer.
        let pool = test_pool().await;
        let mut txn = pool.begin().await.expect("begin");
        upsert_failure(&mut txn, "remote.example", 16, 1_000, 500, true).await.expect("upsert");
        txn.commit().await.expect("commit");

        let raw = sqlx::query("SELECT blacklisted FROM destination_ledger WHERE destination = $1")
            .bind("remote.example")
            .fetch_one(&pool)
            .await
            .expect("fetch raw flag");
        assert_eq!(raw.try_get::<i64, _>("blacklisted").expect("integer decode"), 1);

        let row = get(&pool, "remote.example").await.expect("get").expect("row");
        assert!(row.blacklisted);
        assert!(is_blacklisted(&pool, "remote.example").await.expect("flag"));
    }
}
