//! Outbound event shapes: the PDU/EDU split, queue-facing wrappers, and the
//! batch handed to transports.
//!
//! These follow the Matrix federation PDU/EDU structure. The delivery layer
//! treats payloads as opaque JSON once queued; only the kind tag and the
//! per-destination ordering matter here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Wire payloads ───────────────────────────────────────────────────────────

/// A persistent event (PDU). Stored durably and retried until the
/// destination confirms it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pdu {
    /// Globally unique event ID (`$<opaque>:<server_name>`).
    pub event_id: String,
    /// Origin server name.
    pub origin: String,
    /// Event type (e.g. `m.room.message`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// The room this event belongs to.
    pub room_id: String,
    /// User who sent the event (`@user:server_name`).
    pub sender: String,
    /// Unix millisecond timestamp on the origin server.
    pub origin_server_ts: i64,
    /// Structured event content, varies per event type.
    pub content: serde_json::Value,
    /// Previous event IDs for DAG ordering.
    #[serde(default)]
    pub prev_events: Vec<String>,
    /// Signatures from the origin server, keyed by server then key ID.
    #[serde(default)]
    pub signatures: HashMap<String, HashMap<String, String>>,
    /// Content hashes, keyed by algorithm.
    #[serde(default)]
    pub hashes: HashMap<String, String>,
}

/// An ephemeral event (EDU). Queued like a PDU but allowed to expire
/// instead of being retried forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edu {
    /// EDU type (e.g. `m.typing`, `m.presence`).
    pub edu_type: String,
    /// Origin server name.
    pub origin: String,
    pub content: serde_json::Value,
}

/// Mint an event ID in the `$<opaque>:<server_name>` form.
pub fn new_event_id(server_name: &str) -> String {
    format!("${}:{}", Uuid::new_v4().simple(), server_name)
}

// ─── Queue-facing wrappers ───────────────────────────────────────────────────

/// The two queueable event families, as stored in the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Pdu,
    Edu,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Pdu => "pdu",
            EventKind::Edu => "edu",
        }
    }

    /// `None` for anything not written by this layer.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdu" => Some(EventKind::Pdu),
            "edu" => Some(EventKind::Edu),
            _ => None,
        }
    }
}

/// A decoded queue payload.
#[derive(Debug, Clone)]
pub enum EventBody {
    Pdu(Pdu),
    Edu(Edu),
}

/// One queue entry handed to the transport: the decoded payload plus the
/// sequence ID used to retire it on confirmation.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub sequence_id: i64,
    pub body: EventBody,
}

impl QueuedEvent {
    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Pdu(_) => EventKind::Pdu,
            EventBody::Edu(_) => EventKind::Edu,
        }
    }
}

// ─── Transport batch ─────────────────────────────────────────────────────────

/// An ordered batch of events bound for one destination.
///
/// Events appear in sequence order. Transports that need the PDU/EDU split
/// (e.g. to build a transaction envelope) use [`pdus`](Self::pdus) and
/// [`edus`](Self::edus); confirmation counts are always over the combined
/// ordered list.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub destination: String,
    pub events: Vec<QueuedEvent>,
}

impl OutboundBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn pdus(&self) -> impl Iterator<Item = &Pdu> {
        self.events.iter().filter_map(|e| match &e.body {
            EventBody::Pdu(pdu) => Some(pdu),
            EventBody::Edu(_) => None,
        })
    }

    pub fn edus(&self) -> impl Iterator<Item = &Edu> {
        self.events.iter().filter_map(|e| match &e.body {
            EventBody::Edu(edu) => Some(edu),
            EventBody::Pdu(_) => None,
        })
    }
}
