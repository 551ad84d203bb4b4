//! Swarm facade — routes inbound messages to agents
//!
//! Explicit mentions win. Without mentions the selector picks one agent
//! under the configured fallback policy.

use std::sync::Arc;

use tracing::{debug, info};

use crate::agents::AgentRegistry;
use crate::backend::ModelBackend;
use crate::dispatch::{AggregatedResult, DispatchConfig, DispatchOrchestrator, DispatchRequest};
use crate::error::{Result, SwarmError};
use crate::memory::MemoryStore;
use crate::mention::parse_mentions;
use crate::performance::PerformanceTracker;
use crate::retry::RetryPolicy;
use crate::selector::{AgentSelector, FallbackPolicy};
use crate::streaming::{StreamHandle, StreamManager, StreamRequest, StreamingSession};
use crate::transport::{Transport, TransportEvent};
use crate::types::{AgentSnapshot, AgentStatus, PerformanceReport, SwarmStatus};

/// Tunables for a swarm
#[derive(Debug, Clone, Default)]
pub struct SwarmOptions {
    pub dispatch: DispatchConfig,
    pub retry: RetryPolicy,
    pub fallback: FallbackPolicy,
}

pub struct Swarm {
    registry: Arc<AgentRegistry>,
    selector: AgentSelector,
    dispatcher: DispatchOrchestrator,
    streams: StreamManager,
    transport: Arc<dyn Transport>,
}

impl Swarm {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backend: Arc<dyn ModelBackend>,
        memory: Arc<dyn MemoryStore>,
        transport: Arc<dyn Transport>,
        options: SwarmOptions,
    ) -> Self {
        let tracker = PerformanceTracker::new(registry.clone(), transport.clone());
        let dispatcher = DispatchOrchestrator::new(
            registry.clone(),
            backend,
            memory,
            tracker,
            options.dispatch,
        )
        .with_retry(options.retry);
        let streams = StreamManager::new(registry.clone(), dispatcher.clone(), transport.clone());

        info!(
            "Swarm ready: {} agents, fallback {:?}",
            registry.len(),
            options.fallback
        );
        Self {
            registry,
            selector: AgentSelector::new(options.fallback),
            dispatcher,
            streams,
            transport,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Target agents for a message: mentioned agents, or the selector's pick
    pub fn route(&self, message: &str, required_tags: &[String]) -> Result<Vec<String>> {
        let mentioned = parse_mentions(message, self.registry.profiles());
        if !mentioned.is_empty() {
            debug!("Routing by mention: {:?}", mentioned);
            return Ok(mentioned);
        }

        match self.selector.select(&self.registry, message, required_tags) {
            Some(agent) => Ok(vec![agent.id().to_string()]),
            None => Err(SwarmError::AgentNotFound(
                "no agent available for this message".into(),
            )),
        }
    }

    /// Batch-dispatch a message to explicit targets, or wherever it routes.
    /// `required_capabilities` only matters when the selector has to pick.
    pub async fn handle_message(
        &self,
        message: &str,
        explicit_targets: Option<Vec<String>>,
        required_capabilities: &[String],
        conversation_id: Option<String>,
    ) -> Result<AggregatedResult> {
        let targets = match explicit_targets {
            Some(targets) if !targets.is_empty() => targets,
            _ => self.route(message, required_capabilities)?,
        };

        let mut request = DispatchRequest::new(message, targets);
        request.conversation_id = conversation_id;
        self.dispatcher.dispatch(request).await
    }

    /// Start a streamed response. Without an explicit agent the first routed
    /// agent answers.
    pub async fn start_stream(
        &self,
        client_id: &str,
        message: &str,
        agent_id: Option<String>,
        required_capabilities: &[String],
        model: Option<String>,
    ) -> Result<StreamHandle> {
        let agent_id = match agent_id {
            Some(id) => id,
            None => self
                .route(message, required_capabilities)?
                .into_iter()
                .next()
                .ok_or_else(|| SwarmError::AgentNotFound("no agent available".into()))?,
        };

        self.streams
            .start(StreamRequest {
                client_id: client_id.to_string(),
                agent_id,
                message: message.to_string(),
                model,
            })
            .await
    }

    pub async fn stop_stream(&self, session_id: &str) -> Result<()> {
        self.streams.stop(session_id).await
    }

    /// Stop a session on behalf of the client that started it
    pub async fn stop_client_stream(&self, client_id: &str, session_id: &str) -> Result<()> {
        self.streams.stop_for_client(session_id, client_id).await
    }

    /// Stop everything a disconnected client left running
    pub async fn disconnect(&self, client_id: &str) -> usize {
        self.streams.stop_client(client_id).await
    }

    pub async fn sessions(&self) -> Vec<StreamingSession> {
        self.streams.sessions().await
    }

    pub fn agents(&self) -> Vec<AgentSnapshot> {
        self.registry.snapshots()
    }

    pub fn status(&self) -> SwarmStatus {
        self.registry.swarm_status()
    }

    pub fn performance(&self, agent_id: &str) -> Result<PerformanceReport> {
        self.registry
            .performance(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.to_string()))
    }

    /// Administrative status change, announced to every client
    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let previous = self.registry.set_status(agent_id, status)?;
        if previous != status {
            info!("Agent '{}' set to {}", agent_id, status);
            self.transport.emit(TransportEvent::agent_status(agent_id, status));
        }
        Ok(())
    }
}
