//! Destination health tracking: consecutive failures, scheduled retries,
//! and the blacklist.
//!
//! This wraps the `destination_ledger` table with the backoff policy. The
//! `*_in` methods run on a caller-supplied transaction so an attempt's
//! queue retirement and its ledger update commit atomically; the rest open
//! their own write transaction through the shared [`Writer`] discipline.

use chrono::{DateTime, Utc};
use sqlx::AnyConnection;

use axon_common::AxonResult;
use axon_db::any_compat::to_millis;
use axon_db::repository;
use axon_db::repository::ledger::LedgerRow;
use axon_db::Database;

use crate::backoff::BackoffPolicy;

/// What a recorded failure did to the destination's schedule.
#[derive(Debug, Clone, Copy)]
pub struct FailureOutcome {
    pub failure_count: i64,
    pub retry_delay: chrono::Duration,
    pub next_retry_at: DateTime<Utc>,
    pub blacklisted: bool,
}

#[derive(Clone)]
pub struct DestinationLedger {
    db: Database,
    policy: BackoffPolicy,
}

impl DestinationLedger {
    pub fn new(db: Database, policy: BackoffPolicy) -> Self {
        Self { db, policy }
    }

    /// Record a failed attempt inside the caller's transaction: bump the
    /// failure count, push the retry time out, blacklist at the threshold.
    /// An existing blacklist is never un-set here.
    pub async fn record_failure_in(
        &self,
        conn: &mut AnyConnection,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, sqlx::Error> {
        let row = repository::ledger::get(&mut *conn, destination).await?;
        let already_blacklisted = row.as_ref().map(|r| r.blacklisted).unwrap_or(false);
        let failure_count = row.map(|r| r.failure_count).unwrap_or(0).saturating_add(1);

        let retry_delay = self.policy.delay_for(failure_count);
        let next_retry_at = now + retry_delay;
        let blacklisted = already_blacklisted || self.policy.should_blacklist(failure_count);

        repository::ledger::upsert_failure(
            conn,
            destination,
            failure_count,
            to_millis(next_retry_at),
            to_millis(now),
            blacklisted,
        )
        .await?;

        if blacklisted && !already_blacklisted {
            tracing::warn!(
                destination = %destination,
                failures = failure_count,
                "Destination blacklisted after repeated delivery failures"
            );
        }

        Ok(FailureOutcome { failure_count, retry_delay, next_retry_at, blacklisted })
    }

    /// Record a successful attempt inside the caller's transaction. Resets
    /// the failure count and retry time; the blacklist flag survives
    /// unless `clear_blacklist` is set (forced retries that fully deliver).
    pub async fn record_success_in(
        &self,
        conn: &mut AnyConnection,
        destination: &str,
        now: DateTime<Utc>,
        clear_blacklist: bool,
    ) -> Result<(), sqlx::Error> {
        let was_blacklisted = if clear_blacklist {
            repository::ledger::get(&mut *conn, destination)
                .await?
                .map(|r| r.blacklisted)
                .unwrap_or(false)
        } else {
            false
        };

        repository::ledger::reset_success(&mut *conn, destination, to_millis(now)).await?;
        if clear_blacklist {
            repository::ledger::clear(&mut *conn, destination).await?;
            if was_blacklisted {
                tracing::info!(
                    destination = %destination,
                    "Blacklist cleared after successful forced delivery"
                );
            }
        }
        Ok(())
    }

    /// Record a failure in its own write transaction.
    pub async fn record_failure(&self, destination: &str) -> AxonResult<FailureOutcome> {
        let mut guard = self.db.writer.begin(&self.db.pool).await?;
        let outcome = self.record_failure_in(guard.conn(), destination, Utc::now()).await?;
        guard.commit().await?;
        Ok(outcome)
    }

    pub async fn is_blacklisted(&self, destination: &str) -> AxonResult<bool> {
        Ok(repository::ledger::is_blacklisted(&self.db.pool, destination).await?)
    }

    pub async fn list_blacklisted(&self) -> AxonResult<Vec<String>> {
        Ok(repository::ledger::list_blacklisted(&self.db.pool).await?)
    }

    /// Operator reset: wipe the failure history and blacklist flag.
    pub async fn clear_blacklist(&self, destination: &str) -> AxonResult<()> {
        let mut guard = self.db.writer.begin(&self.db.pool).await?;
        repository::ledger::clear(guard.conn(), destination).await?;
        guard.commit().await?;
        tracing::info!(destination = %destination, "Blacklist cleared by operator");
        Ok(())
    }

    /// Current ledger row, if the destination has any recorded history.
    pub async fn snapshot(&self, destination: &str) -> AxonResult<Option<LedgerRow>> {
        Ok(repository::ledger::get(&self.db.pool, destination).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_common::config::DatabaseConfig;
    use std::time::Duration;

    async fn test_db() -> Database {
        let config = DatabaseConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
        };
        let db = Database::connect(&config).await.expect("connect");
        db.migrate().await.expect("migrate");
        db
    }

    fn tight_policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(2),
            max: Duration::from_secs(3_600),
            blacklist_threshold: 3,
        }
    }

    #[tokio::test]
    async fn repeated_failures_escalate_to_blacklist() {
        let ledger = DestinationLedger::new(test_db().await, tight_policy());

        let first = ledger.record_failure("flaky.example").await.expect("first");
        assert_eq!(first.failure_count, 1);
        assert_eq!(first.retry_delay, chrono::Duration::seconds(2));
        assert!(!first.blacklisted);

        let second = ledger.record_failure("flaky.example").await.expect("second");
        assert_eq!(second.failure_count, 2);
        assert_eq!(second.retry_delay, chrono::Duration::seconds(4));
        assert!(!second.blacklisted);

        let third = ledger.record_failure("flaky.example").await.expect("third");
        assert_eq!(third.failure_count, 3);
        assert!(third.blacklisted);
        assert!(ledger.is_blacklisted("flaky.example").await.expect("flag"));
        assert_eq!(ledger.list_blacklisted().await.expect("list"), vec!["flaky.example"]);
    }

    #[tokio::test]
    async fn success_resets_failures_but_not_the_blacklist() {
        let db = test_db().await;
        let ledger = DestinationLedger::new(db.clone(), tight_policy());

        for _ in 0..3 {
            ledger.record_failure("flaky.example").await.expect("failure");
        }
        assert!(ledger.is_blacklisted("flaky.example").await.expect("flag"));

        let mut guard = db.writer.begin(&db.pool).await.expect("begin");
        ledger
            .record_success_in(guard.conn(), "flaky.example", Utc::now(), false)
            .await
            .expect("success");
        guard.commit().await.expect("commit");

        let row = ledger.snapshot("flaky.example").await.expect("snapshot").expect("row");
        assert_eq!(row.failure_count, 0);
        assert!(row.next_retry_at.is_none());
        assert!(row.blacklisted, "a plain success must not clear the blacklist");
    }

    #[tokio::test]
    async fn forced_success_clears_the_blacklist() {
        let db = test_db().await;
        let ledger = DestinationLedger::new(db.clone(), tight_policy());

        for _ in 0..3 {
            ledger.record_failure("flaky.example").await.expect("failure");
        }

        let mut guard = db.writer.begin(&db.pool).await.expect("begin");
        ledger
            .record_success_in(guard.conn(), "flaky.example", Utc::now(), true)
            .await
            .expect("forced success");
        guard.commit().await.expect("commit");

        assert!(!ledger.is_blacklisted("flaky.example").await.expect("flag"));
        let row = ledger.snapshot("flaky.example").await.expect("snapshot").expect("row");
        assert_eq!(row.failure_count, 0);
        assert!(row.last_attempt_at.is_some(), "forced success still records the attempt");
    }

    #[tokio::test]
    async fn operator_clear_resets_a_blacklisted_destination() {
        let ledger = DestinationLedger::new(test_db().await, tight_policy());

        for _ in 0..3 {
            ledger.record_failure("flaky.example").await.expect("failure");
        }
        ledger.clear_blacklist("flaky.example").await.expect("clear");

        assert!(!ledger.is_blacklisted("flaky.example").await.expect("flag"));
        assert!(ledger.list_blacklisted().await.expect("list").is_empty());
    }
}
