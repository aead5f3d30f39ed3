//! Per-destination delivery worker.
//!
//! One task per destination with pending work, holding that destination's
//! entry in the shared worker map as its exclusivity token. The worker
//! drains the queue in sequence order, retires what the transport
//! confirms, and parks on backoff, blacklist, or an empty queue. A parked
//! worker that sees no signal within the idle grace period tears itself
//! down; the next wake or sweep respawns it.
//!
//! Ordinary wake-ups are best-effort `try_send`s into a small channel. A
//! wake can be lost in the teardown race (sent just as the worker exits);
//! the periodic sweep re-scans pending destinations, so a lost wake
//! delays a delivery by at most one sweep interval, never indefinitely.
//! Forced wakes wait for channel space instead and are never dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock, Semaphore};

use axon_common::config::DeliveryConfig;
use axon_db::repository;
use axon_db::Database;

use crate::backoff;
use crate::ledger::{DestinationLedger, FailureOutcome};
use crate::transport::Transport;
use crate::types::{EventBody, EventKind, OutboundBatch, QueuedEvent};

/// Destination name → wake channel of its live worker.
pub(crate) type WorkerMap = Arc<RwLock<HashMap<String, mpsc::Sender<WakeReason>>>>;

/// Why a parked worker is being woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// New entries were just enqueued.
    NewWork,
    /// The periodic sweep found this destination with pending entries.
    Sweep,
    /// Operator-forced attempt: bypass backoff timer and blacklist.
    Force,
}

/// How a parked wait ended.
enum Waited {
    Wake(WakeReason),
    TimedOut,
    Shutdown,
}

/// Result of one drain burst.
enum DrainOutcome {
    /// Queue empty; park idle.
    Drained,
    /// Attempt failed; park until the ledger's retry time.
    Backoff(DateTime<Utc>),
    /// Destination crossed the blacklist threshold during this burst.
    Blacklisted,
    /// A storage call failed; pause briefly and re-enter the loop.
    StorageFailure,
    Shutdown,
}

/// Decode a stored payload back into its event body.
pub(crate) fn decode_event(kind: EventKind, payload: &str) -> Result<EventBody, serde_json::Error> {
    match kind {
        EventKind::Pdu => Ok(EventBody::Pdu(serde_json::from_str(payload)?)),
        EventKind::Edu => Ok(EventBody::Edu(serde_json::from_str(payload)?)),
    }
}

pub(crate) struct DestinationQueue<T: Transport> {
    destination: String,
    db: Database,
    ledger: DestinationLedger,
    transport: Arc<T>,
    config: DeliveryConfig,
    wake_rx: mpsc::Receiver<WakeReason>,
    /// Our own sender, kept to verify map ownership on teardown.
    wake_tx: mpsc::Sender<WakeReason>,
    shutdown: watch::Receiver<bool>,
    drain_permits: Arc<Semaphore>,
    workers: WorkerMap,
}

impl<T: Transport> DestinationQueue<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        destination: String,
        db: Database,
        ledger: DestinationLedger,
        transport: Arc<T>,
        config: DeliveryConfig,
        wake_rx: mpsc::Receiver<WakeReason>,
        wake_tx: mpsc::Sender<WakeReason>,
        shutdown: watch::Receiver<bool>,
        drain_permits: Arc<Semaphore>,
        workers: WorkerMap,
    ) -> Self {
        Self {
            destination,
            db,
            ledger,
            transport,
            config,
            wake_rx,
            wake_tx,
            shutdown,
            drain_permits,
            workers,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(destination = %self.destination, "Delivery worker started");
        let idle_grace = Duration::from_secs(self.config.idle_timeout_secs);
        let mut forced = false;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Respect persisted state before attempting anything, unless
            // this pass was forced by an operator.
            if !forced {
                let row = match self.ledger.snapshot(&self.destination).await {
                    Ok(row) => row,
                    Err(error) => {
                        tracing::warn!(
                            destination = %self.destination,
                            %error,
                            "Failed to read destination ledger; pausing"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                if row.as_ref().is_some_and(|r| r.blacklisted) {
                    // Parked until clear_blacklist (which wakes us to
                    // re-check) or a forced retry. Idle timeout applies:
                    // the blacklist flag lives in the database, not here.
                    match self.wait_for_wake(idle_grace).await {
                        Waited::Wake(WakeReason::Force) => forced = true,
                        Waited::Wake(_) => continue,
                        Waited::TimedOut | Waited::Shutdown => break,
                    }
                } else if let Some(next_retry_at) = row.and_then(|r| r.next_retry_at) {
                    if !backoff::is_due(Some(next_retry_at), Utc::now()) {
                        match self.wait_until(next_retry_at).await {
                            Waited::Wake(WakeReason::Force) => forced = true,
                            Waited::Wake(_) | Waited::TimedOut => {}
                            Waited::Shutdown => break,
                        }
                    }
                }
            }

            // One drain burst per permit; the permit is dropped before any
            // parking so a backing-off worker never starves active ones.
            let permit = match self.drain_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let outcome = self.drain(forced).await;
            drop(permit);
            forced = false;

            match outcome {
                DrainOutcome::Drained => match self.wait_for_wake(idle_grace).await {
                    Waited::Wake(WakeReason::Force) => forced = true,
                    Waited::Wake(_) => {}
                    Waited::TimedOut => {
                        tracing::debug!(destination = %self.destination, "Worker idle; exiting");
                        break;
                    }
                    Waited::Shutdown => break,
                },
                DrainOutcome::Backoff(until) => match self.wait_until(until).await {
                    Waited::Wake(WakeReason::Force) => forced = true,
                    Waited::Wake(_) | Waited::TimedOut => {}
                    Waited::Shutdown => break,
                },
                DrainOutcome::Blacklisted => {}
                DrainOutcome::StorageFailure => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                DrainOutcome::Shutdown => break,
            }
        }

        // Deregister, but only if the map still points at this worker; a
        // replacement may already have been spawned after a lost wake.
        {
            let mut workers = self.workers.write().await;
            if workers
                .get(&self.destination)
                .is_some_and(|tx| tx.same_channel(&self.wake_tx))
            {
                workers.remove(&self.destination);
            }
        }
        tracing::debug!(destination = %self.destination, "Delivery worker stopped");
    }

    /// Send batches until the queue is empty or an attempt fails.
    async fn drain(&mut self, forced: bool) -> DrainOutcome {
        loop {
            let batch = match repository::queue::select_batch(
                &self.db.pool,
                &self.destination,
                0,
                i64::from(self.config.batch_size),
            )
            .await
            {
                Ok(batch) => batch,
                Err(error) => {
                    tracing::warn!(
                        destination = %self.destination,
                        %error,
                        "Failed to load pending deliveries"
                    );
                    return DrainOutcome::StorageFailure;
                }
            };
            if batch.is_empty() {
                return DrainOutcome::Drained;
            }

            // Split out entries that must not go over the wire: expired
            // EDUs and payloads that no longer decode.
            let now = Utc::now();
            let mut discard: Vec<(i64, i64)> = Vec::new();
            let mut live: Vec<QueuedEvent> = Vec::new();
            let mut live_ids: Vec<(i64, i64)> = Vec::new();
            for entry in batch {
                if entry.expires_at.is_some_and(|at| at <= now) {
                    tracing::debug!(
                        destination = %self.destination,
                        sequence_id = entry.sequence_id,
                        "Dropping expired event"
                    );
                    discard.push((entry.sequence_id, entry.blob_id));
                    continue;
                }
                let body = match EventKind::parse(&entry.kind) {
                    Some(kind) => match decode_event(kind, &entry.payload) {
                        Ok(body) => Some(body),
                        Err(error) => {
                            tracing::error!(
                                destination = %self.destination,
                                sequence_id = entry.sequence_id,
                                %error,
                                "Quarantining undecodable queued payload"
                            );
                            None
                        }
                    },
                    None => {
                        tracing::error!(
                            destination = %self.destination,
                            sequence_id = entry.sequence_id,
                            kind = %entry.kind,
                            "Quarantining queue entry with unknown kind"
                        );
                        None
                    }
                };
                match body {
                    Some(body) => {
                        live_ids.push((entry.sequence_id, entry.blob_id));
                        live.push(QueuedEvent { sequence_id: entry.sequence_id, body });
                    }
                    None => discard.push((entry.sequence_id, entry.blob_id)),
                }
            }

            if !discard.is_empty() {
                if let Err(error) = self.retire_without_delivery(&discard).await {
                    tracing::warn!(
                        destination = %self.destination,
                        %error,
                        "Failed to retire dead queue entries"
                    );
                    return DrainOutcome::StorageFailure;
                }
            }
            if live.is_empty() {
                // The whole batch was discards; the table shrank, so the
                // next pass makes progress.
                continue;
            }

            let total = live.len();
            let batch = OutboundBatch { destination: self.destination.clone(), events: live };
            tracing::debug!(destination = %self.destination, events = total, "Sending delivery batch");

            let sent = tokio::select! {
                result = self.transport.send_batch(&self.destination, batch) => result,
                _ = self.shutdown.changed() => return DrainOutcome::Shutdown,
            };

            match sent {
                Ok(confirmed) if confirmed >= total => {
                    if let Err(error) = self.retire_success(&live_ids, forced).await {
                        tracing::warn!(
                            destination = %self.destination,
                            %error,
                            "Failed to retire delivered batch"
                        );
                        return DrainOutcome::StorageFailure;
                    }
                }
                Ok(confirmed) => {
                    // Partial delivery: the confirmed prefix is done for
                    // good, the attempt still counts as a failure.
                    match self.retire_partial(&live_ids[..confirmed]).await {
                        Ok(outcome) => {
                            tracing::debug!(
                                destination = %self.destination,
                                confirmed,
                                of = total,
                                failures = outcome.failure_count,
                                "Partial delivery"
                            );
                            return self.failed(outcome);
                        }
                        Err(error) => {
                            tracing::warn!(
                                destination = %self.destination,
                                %error,
                                "Failed to record partial delivery"
                            );
                            return DrainOutcome::StorageFailure;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(destination = %self.destination, %error, "Delivery attempt failed");
                    match self.ledger.record_failure(&self.destination).await {
                        Ok(outcome) => return self.failed(outcome),
                        Err(error) => {
                            tracing::warn!(
                                destination = %self.destination,
                                %error,
                                "Failed to record delivery failure"
                            );
                            return DrainOutcome::StorageFailure;
                        }
                    }
                }
            }
        }
    }

    fn failed(&self, outcome: FailureOutcome) -> DrainOutcome {
        if outcome.blacklisted {
            DrainOutcome::Blacklisted
        } else {
            DrainOutcome::Backoff(outcome.next_retry_at)
        }
    }

    /// Retire entries the destination never needs to see (expired or
    /// corrupt), garbage-collecting their blobs.
    async fn retire_without_delivery(&self, entries: &[(i64, i64)]) -> Result<(), sqlx::Error> {
        let mut guard = self.db.writer.begin(&self.db.pool).await?;
        for &(sequence_id, _) in entries {
            repository::queue::remove(guard.conn(), &self.destination, sequence_id).await?;
        }
        let blob_ids: Vec<i64> = entries.iter().map(|&(_, blob_id)| blob_id).collect();
        repository::blobs::delete_unreferenced(guard.conn(), &blob_ids).await?;
        guard.commit().await?;
        Ok(())
    }

    /// Retire a fully confirmed batch and reset the failure ledger, all in
    /// one transaction.
    async fn retire_success(
        &self,
        entries: &[(i64, i64)],
        clear_blacklist: bool,
    ) -> Result<(), sqlx::Error> {
        let mut guard = self.db.writer.begin(&self.db.pool).await?;
        for &(sequence_id, _) in entries {
            repository::queue::remove(guard.conn(), &self.destination, sequence_id).await?;
        }
        let blob_ids: Vec<i64> = entries.iter().map(|&(_, blob_id)| blob_id).collect();
        repository::blobs::delete_unreferenced(guard.conn(), &blob_ids).await?;
        self.ledger
            .record_success_in(guard.conn(), &self.destination, Utc::now(), clear_blacklist)
            .await?;
        guard.commit().await?;
        tracing::debug!(
            destination = %self.destination,
            retired = entries.len(),
            "Batch delivered"
        );
        Ok(())
    }

    /// Retire only the confirmed prefix and record the failed attempt, in
    /// one transaction.
    async fn retire_partial(
        &self,
        confirmed: &[(i64, i64)],
    ) -> Result<FailureOutcome, sqlx::Error> {
        let mut guard = self.db.writer.begin(&self.db.pool).await?;
        for &(sequence_id, _) in confirmed {
            repository::queue::remove(guard.conn(), &self.destination, sequence_id).await?;
        }
        let blob_ids: Vec<i64> = confirmed.iter().map(|&(_, blob_id)| blob_id).collect();
        repository::blobs::delete_unreferenced(guard.conn(), &blob_ids).await?;
        let outcome =
            self.ledger.record_failure_in(guard.conn(), &self.destination, Utc::now()).await?;
        guard.commit().await?;
        Ok(outcome)
    }

    /// Park until a wake, shutdown, or the time limit.
    async fn wait_for_wake(&mut self, limit: Duration) -> Waited {
        tokio::select! {
            wake = self.wake_rx.recv() => match wake {
                Some(reason) => Waited::Wake(reason),
                None => Waited::Shutdown,
            },
            _ = self.shutdown.changed() => Waited::Shutdown,
            _ = tokio::time::sleep(limit) => Waited::TimedOut,
        }
    }

    /// Park until the destination's persisted retry time. Ordinary wakes
    /// re-read the ledger, so a reset while parked takes effect without
    /// waiting out the stale deadline; only a forced wake overrides a
    /// deadline that still stands.
    async fn wait_until(&mut self, mut deadline: DateTime<Utc>) -> Waited {
        loop {
            let now = Utc::now();
            if now >= deadline {
                return Waited::TimedOut;
            }
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            match self.wait_for_wake(remaining).await {
                Waited::Wake(WakeReason::Force) => return Waited::Wake(WakeReason::Force),
                Waited::Wake(_) => match self.ledger.snapshot(&self.destination).await {
                    Ok(row) => match row.and_then(|r| r.next_retry_at) {
                        Some(at) => deadline = at,
                        None => return Waited::TimedOut,
                    },
                    Err(error) => {
                        tracing::warn!(
                            destination = %self.destination,
                            %error,
                            "Failed to re-read retry time; keeping the current deadline"
                        );
                    }
                },
                Waited::TimedOut => return Waited::TimedOut,
                Waited::Shutdown => return Waited::Shutdown,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_stored_pdu_payloads() {
        let payload = json!({
            "event_id": "$e1:origin.example",
            "origin": "origin.example",
            "type": "m.room.message",
            "room_id": "!room:origin.example",
            "sender": "@alice:origin.example",
            "origin_server_ts": 1_700_000_000_000i64,
            "content": {"body": "hi"},
        })
        .to_string();

        match decode_event(EventKind::Pdu, &payload).expect("decode") {
            EventBody::Pdu(pdu) => {
                assert_eq!(pdu.event_id, "$e1:origin.example");
                assert_eq!(pdu.event_type, "m.room.message");
                assert!(pdu.prev_events.is_empty());
            }
            EventBody::Edu(_) => panic!("decoded a PDU payload as an EDU"),
        }
    }

    #[test]
    fn decodes_stored_edu_payloads() {
        let payload = json!({
            "edu_type": "m.typing",
            "origin": "origin.example",
            "content": {"typing": true},
        })
        .to_string();

        match decode_event(EventKind::Edu, &payload).expect("decode") {
            EventBody::Edu(edu) => assert_eq!(edu.edu_type, "m.typing"),
            EventBody::Pdu(_) => panic!("decoded an EDU payload as a PDU"),
        }
    }

    #[test]
    fn corrupt_payloads_fail_to_decode() {
        assert!(decode_event(EventKind::Pdu, "not json").is_err());
        assert!(decode_event(EventKind::Pdu, r#"{"event_id": 42}"#).is_err());
        assert!(decode_event(EventKind::Edu, r#"{"content": {}}"#).is_err());
    }
}
