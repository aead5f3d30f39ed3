//! Per-destination delivery queues.
//!
//! Each row is one pending delivery of one blob to one destination,
//! ordered by the globally minted `sequence_id`. Rows are hard-deleted on
//! retirement; whatever is in the table after a restart is exactly the
//! backlog that still needs sending.

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, AnyPool, FromRow, Row};

use crate::any_compat;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
    destination TEXT NOT NULL,
    sequence_id BIGINT NOT NULL,
    kind TEXT NOT NULL,
    blob_id BIGINT NOT NULL,
    queued_at BIGINT NOT NULL,
    expires_at BIGINT,
    PRIMARY KEY (destination, sequence_id)
);
CREATE INDEX IF NOT EXISTS queue_entries_blob_id_idx ON queue_entries (blob_id);
"#;

/// A queue entry joined with its payload, ready for dispatch.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub sequence_id: i64,
    pub kind: String,
    pub blob_id: i64,
    pub payload: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, AnyRow> for PendingDelivery {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            sequence_id: row.try_get("sequence_id")?,
            kind: row.try_get("kind")?,
            blob_id: row.try_get("blob_id")?,
            payload: row.try_get("payload")?,
            expires_at: any_compat::get_opt_millis_datetime(row, "expires_at")?,
        })
    }
}

pub async fn insert(
    conn: &mut AnyConnection,
    destination: &str,
    sequence_id: i64,
    kind: &str,
    blob_id: i64,
    queued_at: i64,
    expires_at: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO queue_entries (destination, sequence_id, kind, blob_id, queued_at, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(destination)
    .bind(sequence_id)
    .bind(kind)
    .bind(blob_id)
    .bind(queued_at)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// The oldest pending deliveries for a destination, strictly after
/// `after_seq`, joined with their payloads. Non-destructive: rows stay
/// queued until explicitly removed.
pub async fn select_batch(
    pool: &AnyPool,
    destination: &str,
    after_seq: i64,
    limit: i64,
) -> Result<Vec<PendingDelivery>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT q.sequence_id, q.kind, q.blob_id, q.expires_at, b.payload \
         FROM queue_entries q \
         JOIN event_blobs b ON b.blob_id = q.blob_id \
         WHERE q.destination = $1 AND q.sequence_id > $2 \
         ORDER BY q.sequence_id ASC \
         LIMIT $3",
    )
    .bind(destination)
    .bind(after_seq)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(PendingDelivery::from_row).collect()
}

/// Remove one entry. Returns 0 if it was already gone, which callers
/// treat as success.
pub async fn remove(
    conn: &mut AnyConnection,
    destination: &str,
    sequence_id: i64,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM queue_entries WHERE destination = $1 AND sequence_id = $2")
            .bind(destination)
            .bind(sequence_id)
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected())
}

pub async fn count_for_destination(pool: &AnyPool, destination: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS pending FROM queue_entries WHERE destination = $1")
        .bind(destination)
        .fetch_one(pool)
        .await?;
    row.try_get("pending")
}

/// Every destination with at least one queued entry, for startup recovery
/// and the periodic sweep.
pub async fn destinations_with_pending(pool: &AnyPool) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query("SELECT DISTINCT destination FROM queue_entries")
        .fetch_all(pool)
        .await?;
    rows.iter().map(|r| r.try_get("destination")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::blobs;

    async fn test_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect in-memory sqlite");
        for schema in [blobs::SCHEMA, SCHEMA] {
            sqlx::raw_sql(schema).execute(&pool).await.expect("create schema");
        }
        pool
    }

    async fn seed(pool: &AnyPool, destination: &str, seqs: &[i64]) {
        let mut txn = pool.begin().await.expect("begin");
        for &seq in seqs {
            blobs::insert(&mut txn, seq, &format!(r#"{{"seq":{seq}}}"#))
                .await
                .expect("insert blob");
            insert(&mut txn, destination, seq, "pdu", seq, 0, None)
                .await
                .expect("insert entry");
        }
        txn.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn batches_are_ordered_and_bounded() {
        let pool = test_pool().await;
        seed(&pool, "remote.example", &[5, 1, 3, 4, 2]).await;

        let batch = select_batch(&pool, "remote.example", 0, 3).await.expect("select");
        let seqs: Vec<i64> = batch.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(batch[0].payload, r#"{"seq":1}"#);

        let rest = select_batch(&pool, "remote.example", 3, 10).await.expect("select rest");
        let seqs: Vec<i64> = rest.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn selection_does_not_consume() {
        let pool = test_pool().await;
        seed(&pool, "remote.example", &[1, 2]).await;

        select_batch(&pool, "remote.example", 0, 10).await.expect("first");
        let again = select_batch(&pool, "remote.example", 0, 10).await.expect("second");
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let pool = test_pool().await;
        seed(&pool, "remote.example", &[1]).await;

        let mut txn = pool.begin().await.expect("begin");
        assert_eq!(remove(&mut txn, "remote.example", 1).await.expect("remove"), 1);
        assert_eq!(remove(&mut txn, "remote.example", 1).await.expect("re-remove"), 0);
        txn.commit().await.expect("commit");

        assert_eq!(count_for_destination(&pool, "remote.example").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn pending_destinations_are_distinct() {
        let pool = test_pool().await;
        seed(&pool, "a.example", &[1, 2]).await;
        seed(&pool, "b.example", &[3]).await;

        let mut destinations = destinations_with_pending(&pool).await.expect("list");
        destinations.sort();
        assert_eq!(destinations, vec!["a.example", "b.example"]);
    }
}
