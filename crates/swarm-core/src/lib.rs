//! swarm-core - Agent orchestration and dispatch engine
//!
//! This crate provides:
//! - Agent registry with live status and performance metrics
//! - Mention parsing and capability-weighted agent selection
//! - Concurrent fan-out dispatch with retry/backoff and per-agent failure isolation
//! - Cancellable streaming sessions forwarding ordered chunks to a transport
//! - Collaborator traits for model backends, memory stores and transports,
//!   with OpenAI-compatible, Supermemory and in-process implementations

pub mod agents;
pub mod backend;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod mention;
pub mod performance;
pub mod retry;
pub mod selector;
pub mod streaming;
pub mod swarm;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for convenience
pub use agents::{AgentProfile, AgentRegistry, Capability};
pub use backend::{CompletionOptions, CompletionRequest, ModelBackend, OpenAiCompatBackend};
pub use dispatch::{
    AggregatedResult, DispatchConfig, DispatchOrchestrator, DispatchOutcome, DispatchRequest,
    DispatchStatus,
};
pub use error::{BackendError, FaultKind, Result, SwarmError};
pub use memory::{LocalMemory, MemoryStore, NoopMemory, SupermemoryClient};
pub use mention::parse_mentions;
pub use retry::RetryPolicy;
pub use selector::{AgentSelector, FallbackPolicy};
pub use streaming::{SessionState, StreamHandle, StreamManager, StreamRequest, StreamingSession};
pub use swarm::{Swarm, SwarmOptions};
pub use transport::{ChannelTransport, EventTarget, NullTransport, Transport, TransportEvent};
pub use types::{AgentSnapshot, AgentStatus, PerformanceMetrics, PerformanceReport, SwarmStatus};
