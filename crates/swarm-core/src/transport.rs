//! Transport collaborator — where outbound events go
//!
//! The core only emits. Delivery (WebSocket fan-out, per-client routing) is the
//! transport's job.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::AgentStatus;

/// Well-known event names
pub mod events {
    pub const STREAM_START: &str = "response_stream_start";
    pub const STREAM_CHUNK: &str = "response_stream_chunk";
    pub const STREAM_END: &str = "response_stream_end";
    pub const STREAM_ERROR: &str = "response_stream_error";
    pub const STREAM_CANCELLED: &str = "response_stream_cancelled";
    pub const STREAM_STOPPED: &str = "stream_stopped";
    pub const AGENT_STATUS_UPDATE: &str = "agent_status_update";
}

/// Who receives an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventTarget {
    Client(String),
    Broadcast,
}

impl EventTarget {
    /// Should a connection owned by `client_id` see this event
    pub fn includes(&self, client_id: &str) -> bool {
        match self {
            Self::Client(id) => id == client_id,
            Self::Broadcast => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEvent {
    pub event: String,
    pub data: Value,
    pub target: EventTarget,
}

impl TransportEvent {
    pub fn to_client(client_id: impl Into<String>, event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
            target: EventTarget::Client(client_id.into()),
        }
    }

    pub fn broadcast(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
            target: EventTarget::Broadcast,
        }
    }

    pub fn agent_status(agent_id: &str, status: AgentStatus) -> Self {
        Self::broadcast(
            events::AGENT_STATUS_UPDATE,
            json!({
                "agent_id": agent_id,
                "status": status,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
    }
}

/// Outbound event sink. Emitting never blocks and never fails the caller.
pub trait Transport: Send + Sync {
    fn emit(&self, event: TransportEvent);
}

/// Drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn emit(&self, _event: TransportEvent) {}
}

/// Forwards events into an unbounded channel, preserving emit order
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            debug!("ChannelTransport: receiver dropped, event discarded");
        }
    }
}
