//! # axon-outbound
//!
//! Durable outbound delivery for Axon federation traffic.
//!
//! ## Architecture
//!
//! Events accepted for delivery are written to per-destination queues in
//! the database before anything touches the network; the tables are the
//! source of truth, and in-memory workers are disposable views over them.
//!
//! ```text
//!  submit_pdu / submit_edu
//!        │
//!        ▼  one write transaction
//!  ┌─────────────────────────────┐
//!  │ event_blobs   (payload ×1)  │
//!  │ queue_entries (row per dest)│
//!  └─────────────────────────────┘
//!        │ wake
//!        ▼
//!  per-destination worker ──► Transport::send_batch(destination, batch)
//!        │                          │
//!        │ confirmed prefix         │ failure
//!        ▼                          ▼
//!  retire entries + GC blobs   destination_ledger (backoff / blacklist)
//! ```
//!
//! ## Key concepts
//!
//! - **Durable fan-out** (`dispatcher.rs`): a submitted event stores its
//!   payload once and mints one ordered queue entry per destination, all
//!   in a single transaction. Delivery is asynchronous and survives
//!   restarts.
//! - **Per-destination workers** (`queue.rs`): one task per destination
//!   with pending work, draining strictly in sequence order. Workers park
//!   on backoff or blacklist, tear down when idle, and are respawned by
//!   wakes or the periodic sweep.
//! - **Cut-point confirmation** (`transport.rs`): a transport reports how
//!   many leading events of a batch the destination accepted. The
//!   confirmed prefix is retired permanently; anything after it is
//!   retried later.
//! - **Failure ledger** (`ledger.rs`, `backoff.rs`): consecutive failures
//!   schedule exponentially later retries and eventually blacklist the
//!   destination. Blacklisted destinations keep accumulating entries but
//!   are only attempted on operator request.

pub mod backoff;
pub mod dispatcher;
pub mod ledger;
mod queue;
pub mod transport;
pub mod types;

pub use backoff::BackoffPolicy;
pub use dispatcher::Dispatcher;
pub use ledger::{DestinationLedger, FailureOutcome};
pub use transport::{Transport, TransportError};
pub use types::{new_event_id, Edu, EventBody, EventKind, OutboundBatch, Pdu, QueuedEvent};
