//! Gateway WebSocket protocol — JSON messages between clients and the server

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swarm_core::{SwarmError, TransportEvent};

/// Client → Gateway request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Optional request ID for correlating responses
    #[serde(default)]
    pub id: Option<String>,
}

/// Gateway → Client response (to a specific request)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Echoed from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

/// Error in a gateway response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub code: i32,
    pub message: String,
}

/// Gateway → Client event (no request ID)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    pub data: Value,
}

// ── Well-known methods ──

/// Methods the client can call
pub mod methods {
    pub const MESSAGE_SEND: &str = "message.send";
    pub const STREAM_START: &str = "stream.start";
    pub const STREAM_STOP: &str = "stream.stop";
    pub const AGENTS_LIST: &str = "agents.list";
    pub const AGENT_PERFORMANCE: &str = "agent.performance";
    pub const AGENT_STATUS_SET: &str = "agent.status.set";
    pub const STATUS_GET: &str = "status.get";
}

/// Events only the gateway sends; streaming and status events come from the core
pub mod events {
    pub const CONNECTED: &str = "connected";
    pub use swarm_core::transport::events::*;
}

// ── Error codes ──

pub const ERR_INVALID_METHOD: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_INTERNAL: i32 = -32603;
pub const ERR_NOT_FOUND: i32 = -32004;

impl GatewayResponse {
    pub fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(GatewayError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Map a core error to a response. Backend details never reach the client.
    pub fn from_error(id: Option<String>, err: &SwarmError) -> Self {
        match err {
            SwarmError::AgentNotFound(_) | SwarmError::SessionNotFound(_) => {
                Self::err(id, ERR_NOT_FOUND, err.to_string())
            }
            SwarmError::Validation(_) => Self::err(id, ERR_INVALID_PARAMS, err.to_string()),
            SwarmError::Backend(e) => Self::err(id, ERR_INTERNAL, e.sanitized()),
            SwarmError::Configuration(_) => Self::err(id, ERR_INTERNAL, "server misconfigured"),
        }
    }
}

impl GatewayEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

impl From<TransportEvent> for GatewayEvent {
    fn from(event: TransportEvent) -> Self {
        Self::new(event.event, event.data)
    }
}
