//! Single-writer discipline for backends that cannot interleave concurrent
//! write transactions.
//!
//! SQLite has one physical writer per database. Two tasks opening write
//! transactions on separate pooled connections would hit `SQLITE_BUSY` at
//! commit time, so the exclusive [`Writer`] queues them behind an async
//! mutex and runs them one at a time. PostgreSQL interleaves writers
//! natively, so its writer is a transparent pass-through that just opens a
//! transaction.
//!
//! Callers never branch on backend kind: every multi-step mutation does
//! `writer.begin(&pool)`, works on the guard's connection, then commits.

use std::sync::Arc;

use sqlx::{Any, AnyConnection, AnyPool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Strategy-selected write exclusivity. Cheap to clone; clones share the
/// same underlying lock.
#[derive(Clone)]
pub struct Writer {
    lock: Option<Arc<Mutex<()>>>,
}

impl Writer {
    /// A writer that serializes all write transactions behind one mutex.
    pub fn exclusive() -> Self {
        Self { lock: Some(Arc::new(Mutex::new(()))) }
    }

    /// A writer that relies on the backend's native transaction isolation.
    pub fn passthrough() -> Self {
        Self { lock: None }
    }

    pub fn is_exclusive(&self) -> bool {
        self.lock.is_some()
    }

    /// Open a write transaction, waiting for exclusivity first if this
    /// writer requires it. The permit is held until the guard commits,
    /// rolls back, or is dropped.
    pub async fn begin(&self, pool: &AnyPool) -> Result<WriteGuard, sqlx::Error> {
        let permit = match &self.lock {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        };
        let txn = pool.begin().await?;
        Ok(WriteGuard { txn, _permit: permit })
    }
}

/// An open write transaction plus, for exclusive writers, the permit that
/// keeps every other writer out. Dropping the guard rolls the transaction
/// back and releases the permit.
pub struct WriteGuard {
    txn: Transaction<'static, Any>,
    _permit: Option<OwnedMutexGuard<()>>,
}

impl WriteGuard {
    /// The transaction's connection, for executing statements.
    pub fn conn(&mut self) -> &mut AnyConnection {
        &mut self.txn
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.txn.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.txn.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::any::AnyPoolOptions;
    use std::time::Duration;

    async fn test_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        AnyPoolOptions::new()
            .max_connections(2)
            .connect("sqlite::memory:")
            .await
            .expect("connect in-memory sqlite")
    }

    #[tokio::test]
    async fn exclusive_writer_serializes_transactions() {
        let pool = test_pool().await;
        let writer = Writer::exclusive();

        let first = writer.begin(&pool).await.expect("first begin");

        // While the first guard lives, a second begin must block.
        let blocked = tokio::time::timeout(Duration::from_millis(100), writer.begin(&pool)).await;
        assert!(blocked.is_err(), "second writer acquired the lock while the first held it");

        first.commit().await.expect("commit");

        let second = tokio::time::timeout(Duration::from_millis(500), writer.begin(&pool))
            .await
            .expect("second begin should no longer block")
            .expect("second begin");
        second.rollback().await.expect("rollback");
    }

    #[tokio::test]
    async fn passthrough_writer_allows_concurrent_transactions() {
        let pool = test_pool().await;
        let writer = Writer::passthrough();

        let first = writer.begin(&pool).await.expect("first begin");
        let second = tokio::time::timeout(Duration::from_millis(500), writer.begin(&pool))
            .await
            .expect("pass-through begin should not block")
            .expect("second begin");

        first.commit().await.expect("commit first");
        second.commit().await.expect("commit second");
    }

    #[tokio::test]
    async fn dropping_guard_releases_exclusivity() {
        let pool = test_pool().await;
        let writer = Writer::exclusive();

        {
            let _guard = writer.begin(&pool).await.expect("begin");
            // Dropped without commit: transaction rolls back, permit frees.
        }

        let next = tokio::time::timeout(Duration::from_millis(500), writer.begin(&pool))
            .await
            .expect("lock should be free after drop")
            .expect("begin after drop");
        next.rollback().await.expect("rollback");
    }
}
