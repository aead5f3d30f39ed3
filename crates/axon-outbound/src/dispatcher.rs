//! The outbound dispatcher: accepts events for delivery, fans them out to
//! per-destination queues, and manages the worker tasks that drain them.
//!
//! Submission is durable-first: the blob and every queue entry commit in
//! one write transaction before any worker is woken, so an accepted event
//! survives a crash at any later point. Workers are spawned lazily per
//! destination and torn down when idle; the map entry is the exclusivity
//! token that keeps it to one worker per destination.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock, Semaphore};

use axon_common::config::DeliveryConfig;
use axon_common::AxonResult;
use axon_db::any_compat::now_millis;
use axon_db::repository;
use axon_db::{sequence, Database};

use crate::backoff::BackoffPolicy;
use crate::ledger::DestinationLedger;
use crate::queue::{DestinationQueue, WakeReason, WorkerMap};
use crate::transport::Transport;
use crate::types::{Edu, EventKind, Pdu};

pub struct Dispatcher<T: Transport> {
    inner: Arc<DispatcherInner<T>>,
}

impl<T: Transport> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct DispatcherInner<T: Transport> {
    /// Our own server name; never a delivery target.
    origin: String,
    db: Database,
    ledger: DestinationLedger,
    transport: Arc<T>,
    config: DeliveryConfig,
    workers: WorkerMap,
    /// Bounds how many destinations drain at once.
    drain_permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        db: Database,
        transport: Arc<T>,
        origin: impl Into<String>,
        config: DeliveryConfig,
    ) -> Self {
        let policy = BackoffPolicy::from_config(&config);
        let ledger = DestinationLedger::new(db.clone(), policy);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(DispatcherInner {
                origin: origin.into(),
                db,
                ledger,
                transport,
                workers: Arc::new(RwLock::new(HashMap::new())),
                drain_permits: Arc::new(Semaphore::new(config.worker_limit as usize)),
                config,
                shutdown_tx,
            }),
        }
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Queue a PDU for every listed destination. Returns once the event is
    /// durably stored; delivery happens asynchronously.
    pub async fn submit_pdu(&self, pdu: &Pdu, destinations: &[String]) -> AxonResult<()> {
        let payload = serde_json::to_string(pdu)?;
        self.submit(EventKind::Pdu, payload, destinations, None).await
    }

    /// Queue an EDU for every listed destination. EDUs carry an expiry and
    /// are silently dropped once stale.
    pub async fn submit_edu(&self, edu: &Edu, destinations: &[String]) -> AxonResult<()> {
        let payload = serde_json::to_string(edu)?;
        let ttl = chrono::Duration::seconds(self.inner.config.edu_ttl_secs as i64);
        self.submit(EventKind::Edu, payload, destinations, Some(ttl)).await
    }

    async fn submit(
        &self,
        kind: EventKind,
        payload: String,
        destinations: &[String],
        ttl: Option<chrono::Duration>,
    ) -> AxonResult<()> {
        // Dedup, and drop our own name: a server never federates to itself.
        let targets: Vec<&str> = {
            let mut seen = HashSet::new();
            destinations
                .iter()
                .map(String::as_str)
                .filter(|d| *d != self.inner.origin)
                .filter(|d| seen.insert(*d))
                .collect()
        };
        if targets.is_empty() {
            return Ok(());
        }

        let queued_at = now_millis();
        let expires_at = ttl.map(|t| queued_at + t.num_milliseconds());

        // One blob, one queue entry per destination, one transaction.
        let mut guard = self.inner.db.writer.begin(&self.inner.db.pool).await?;
        let blob_id = sequence::next(guard.conn(), sequence::PAYLOADS).await?;
        repository::blobs::insert(guard.conn(), blob_id, &payload).await?;
        for destination in &targets {
            let sequence_id = sequence::next(guard.conn(), sequence::DELIVERIES).await?;
            repository::queue::insert(
                guard.conn(),
                destination,
                sequence_id,
                kind.as_str(),
                blob_id,
                queued_at,
                expires_at,
            )
            .await?;
        }
        guard.commit().await?;

        tracing::debug!(
            kind = kind.as_str(),
            blob_id,
            destinations = targets.len(),
            "Queued outbound event"
        );

        for destination in targets {
            self.wake(destination, WakeReason::NewWork).await;
        }
        Ok(())
    }

    /// How many entries are queued for a destination right now.
    pub async fn queue_depth(&self, destination: &str) -> AxonResult<i64> {
        Ok(repository::queue::count_for_destination(&self.inner.db.pool, destination).await?)
    }

    pub async fn blacklisted_destinations(&self) -> AxonResult<Vec<String>> {
        self.inner.ledger.list_blacklisted().await
    }

    /// Operator reset: forget a destination's failure history and resume
    /// normal delivery.
    pub async fn clear_blacklist(&self, destination: &str) -> AxonResult<()> {
        self.inner.ledger.clear_blacklist(destination).await?;
        self.wake(destination, WakeReason::NewWork).await;
        Ok(())
    }

    /// Force one delivery attempt right now, ignoring any backoff timer or
    /// blacklist. A forced attempt that fully delivers clears the
    /// blacklist.
    pub async fn retry_now(&self, destination: &str) {
        self.wake(destination, WakeReason::Force).await;
    }

    /// Start the background sweep and recover deliveries left pending by
    /// the previous run.
    pub async fn start(&self) -> AxonResult<()> {
        self.sweep().await?;

        let dispatcher = self.clone();
        let period = Duration::from_secs(self.inner.config.sweep_interval_secs);
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = dispatcher.sweep().await {
                            tracing::warn!(%error, "Periodic queue sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Sweep loop stopped");
        });
        Ok(())
    }

    /// Wake a worker for every destination with pending entries, skipping
    /// blacklisted ones. This is the backstop that repairs lost wakes.
    async fn sweep(&self) -> AxonResult<()> {
        let pending = repository::queue::destinations_with_pending(&self.inner.db.pool).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let blacklisted: HashSet<String> =
            self.inner.ledger.list_blacklisted().await?.into_iter().collect();
        let mut woken = 0;
        for destination in pending {
            if blacklisted.contains(&destination) {
                continue;
            }
            self.wake(&destination, WakeReason::Sweep).await;
            woken += 1;
        }
        if woken > 0 {
            tracing::debug!(destinations = woken, "Sweep woke pending destinations");
        }
        Ok(())
    }

    /// Signal every worker and the sweep loop to stop. In-flight transport
    /// calls are abandoned; unconfirmed entries stay queued for the next
    /// run.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.drain_permits.close();
    }

    /// Deliver a wake to the destination's worker, spawning one if needed.
    /// Ordinary wakes are best-effort: a full channel already holds a
    /// pending wake and the worker re-checks the table. Forced wakes are
    /// never dropped; on a full channel they wait for space.
    async fn wake(&self, destination: &str, reason: WakeReason) {
        loop {
            // Fast path under the read lock.
            let blocked = {
                let workers = self.inner.workers.read().await;
                match workers.get(destination) {
                    Some(tx) => match tx.try_send(reason) {
                        Ok(()) => return,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            if reason == WakeReason::Force {
                                Some(tx.clone())
                            } else {
                                return;
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => None,
                    },
                    None => None,
                }
            };

            // The awaited send runs outside both locks: a tearing-down
            // worker needs the write lock to deregister.
            if let Some(tx) = blocked {
                if tx.send(reason).await.is_ok() {
                    return;
                }
                // The worker exited while we waited; respawn below.
                continue;
            }

            // Missing or dead worker: take the write lock so exactly one
            // caller wins the respawn.
            let mut workers = self.inner.workers.write().await;
            match workers.entry(destination.to_string()) {
                Entry::Occupied(mut entry) => match entry.get().try_send(reason) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if reason != WakeReason::Force {
                            return;
                        }
                        // Back to the top; the read-lock pass clones the
                        // sender and waits.
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        entry.insert(self.spawn_worker(destination, reason));
                        return;
                    }
                },
                Entry::Vacant(entry) => {
                    entry.insert(self.spawn_worker(destination, reason));
                    return;
                }
            }
        }
    }

    fn spawn_worker(&self, destination: &str, initial: WakeReason) -> mpsc::Sender<WakeReason> {
        let (tx, rx) = mpsc::channel(8);
        // Seed the reason so a fresh worker parked on the blacklist or a
        // backoff timer still sees a forced wake.
        let _ = tx.try_send(initial);
        let worker = DestinationQueue::new(
            destination.to_string(),
            self.inner.db.clone(),
            self.inner.ledger.clone(),
            Arc::clone(&self.inner.transport),
            self.inner.config.clone(),
            rx,
            tx.clone(),
            self.inner.shutdown_tx.subscribe(),
            Arc::clone(&self.inner.drain_permits),
            Arc::clone(&self.inner.workers),
        );
        tokio::spawn(worker.run());
        tx
    }
}
