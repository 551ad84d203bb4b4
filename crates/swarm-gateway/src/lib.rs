//! swarm-gateway — WebSocket control plane for the agent swarm
//!
//! Clients connect over WebSocket to send messages, open and stop response
//! streams, and watch agent status. The event bus doubles as the swarm's
//! transport, so stream chunks reach only the client that asked for them.

pub mod clients;
pub mod events;
pub mod protocol;
pub mod server;

pub use events::EventBus;
pub use server::GatewayServer;
