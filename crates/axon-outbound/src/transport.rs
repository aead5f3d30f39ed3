//! The seam between durable queueing and actual wire delivery.
//!
//! The delivery layer never speaks a protocol itself. It hands an ordered
//! [`OutboundBatch`] to a [`Transport`] and interprets the result purely as
//! a cut point: how many leading events the destination confirmed.

use std::future::Future;

use crate::types::OutboundBatch;

/// Errors a transport can report for a whole attempt.
///
/// These are never surfaced to event producers; they feed the failure
/// ledger and backoff state for the destination.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the destination at all (DNS, connect, TLS).
    #[error("destination {0} is unreachable")]
    Unreachable(String),

    /// The destination was reached but did not answer in time.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// The destination answered and refused the transaction.
    #[error("destination {destination} rejected the transaction: {reason}")]
    Rejected { destination: String, reason: String },

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Sends batches to remote destinations.
///
/// `Ok(n)` means the destination confirmed the first `n` events of the
/// batch, in order. `n` equal to the batch length is full success;
/// anything less is a partial delivery, and the attempt still counts as a
/// failure for backoff purposes. `Err(_)` confirms nothing. Implementations
/// must not report `Ok(n)` for events the destination has not durably
/// accepted: confirmed events are deleted from the queue and will never be
/// sent again.
pub trait Transport: Send + Sync + 'static {
    fn send_batch(
        &self,
        destination: &str,
        batch: OutboundBatch,
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;
}
