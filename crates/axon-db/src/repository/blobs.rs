//! Event payload storage, shared across queue entries.
//!
//! A payload submitted to many destinations is written once and referenced
//! by `blob_id` from each destination's queue entry. Blobs are deleted only
//! once no queue entry references them.

use sqlx::{AnyConnection, AnyPool, Row};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_blobs (
    blob_id BIGINT PRIMARY KEY,
    payload TEXT NOT NULL
);
"#;

pub async fn insert(
    conn: &mut AnyConnection,
    blob_id: i64,
    payload: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO event_blobs (blob_id, payload) VALUES ($1, $2)")
        .bind(blob_id)
        .bind(payload)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn payload_for(pool: &AnyPool, blob_id: i64) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT payload FROM event_blobs WHERE blob_id = $1")
        .bind(blob_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| r.try_get("payload")).transpose()
}

/// Delete each blob unless some queue entry still references it. Returns
/// how many were actually removed.
///
/// The Any driver cannot reuse a placeholder, so the id is bound twice.
pub async fn delete_unreferenced(
    conn: &mut AnyConnection,
    blob_ids: &[i64],
) -> Result<u64, sqlx::Error> {
    let mut deleted = 0;
    for &blob_id in blob_ids {
        let result = sqlx::query(
            "DELETE FROM event_blobs WHERE blob_id = $1 \
             AND NOT EXISTS (SELECT 1 FROM queue_entries WHERE blob_id = $2)",
        )
        .bind(blob_id)
        .bind(blob_id)
        .execute(&mut *conn)
        .await?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}
