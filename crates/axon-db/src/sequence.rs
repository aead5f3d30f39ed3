//! Named monotonic counters backed by a single-row-per-name table.
//!
//! Positions are minted inside the caller's transaction, so a rolled-back
//! write never leaks a position into use. Gaps are still possible (a
//! rollback discards the minted value) and harmless: consumers only rely
//! on the ordering being strictly increasing.

use sqlx::{AnyConnection, AnyPool, Row};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stream_sequences (
    name TEXT PRIMARY KEY,
    position BIGINT NOT NULL
);
"#;

/// Counter for content blob identifiers.
pub const PAYLOADS: &str = "payloads";
/// Counter for per-destination delivery ordering.
pub const DELIVERIES: &str = "deliveries";

/// Seed a counter row at zero if it does not exist yet.
pub async fn ensure(pool: &AnyPool, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO stream_sequences (name, position) VALUES ($1, 0) ON CONFLICT (name) DO NOTHING")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mint the next position for `name` within the caller's transaction.
pub async fn next(conn: &mut AnyConnection, name: &str) -> Result<i64, sqlx::Error> {
    let row =
        sqlx::query("UPDATE stream_sequences SET position = position + 1 WHERE name = $1 RETURNING position")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    row.try_get("position")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::any::AnyPoolOptions;

    async fn seeded_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect in-memory sqlite");
        sqlx::raw_sql(SCHEMA).execute(&pool).await.expect("create schema");
        ensure(&pool, PAYLOADS).await.expect("seed payloads");
        ensure(&pool, DELIVERIES).await.expect("seed deliveries");
        pool
    }

    #[tokio::test]
    async fn positions_are_strictly_increasing() {
        let pool = seeded_pool().await;
        let mut txn = pool.begin().await.expect("begin");
        for expected in 1..=5i64 {
            let got = next(&mut txn, PAYLOADS).await.expect("next position");
            assert_eq!(got, expected);
        }
        txn.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn counters_advance_independently() {
        let pool = seeded_pool().await;
        let mut txn = pool.begin().await.expect("begin");
        assert_eq!(next(&mut txn, PAYLOADS).await.expect("payloads"), 1);
        assert_eq!(next(&mut txn, DELIVERIES).await.expect("deliveries"), 1);
        assert_eq!(next(&mut txn, DELIVERIES).await.expect("deliveries"), 2);
        assert_eq!(next(&mut txn, PAYLOADS).await.expect("payloads"), 2);
        txn.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let pool = seeded_pool().await;
        ensure(&pool, PAYLOADS).await.expect("re-seed");
        let mut txn = pool.begin().await.expect("begin");
        assert_eq!(next(&mut txn, PAYLOADS).await.expect("next"), 1);
        txn.commit().await.expect("commit");
    }
}
