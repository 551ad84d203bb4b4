//! Streaming sessions — one agent, one incremental response, cancellable
//!
//! Each session runs in its own task and forwards chunks to the transport in
//! arrival order. `stop` only flips the session's cancellation token; the
//! consuming task notices at the next chunk boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::AgentRegistry;
use crate::backend::ChunkStream;
use crate::dispatch::DispatchOrchestrator;
use crate::error::{BackendError, Result, SwarmError};
use crate::memory::InteractionRecord;
use crate::performance::{TaskGuard, TaskOutcome};
use crate::transport::{Transport, TransportEvent, events};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Streaming,
    Completed,
    Cancelled,
    Errored,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Public view of a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSession {
    pub session_id: String,
    pub client_id: String,
    pub agent_id: String,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub client_id: String,
    pub agent_id: String,
    pub message: String,
    /// Overrides the agent's configured model
    pub model: Option<String>,
}

struct SessionEntry {
    session: StreamingSession,
    token: CancellationToken,
}

/// Handle to a started session
#[derive(Debug)]
pub struct StreamHandle {
    pub session_id: String,
    pub agent_id: String,
    task: JoinHandle<SessionState>,
}

impl StreamHandle {
    /// Wait for the session to reach a terminal state
    pub async fn finished(self) -> SessionState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!("Stream session {} task failed: {}", self.session_id, e);
                SessionState::Errored
            }
        }
    }
}

#[derive(Clone)]
pub struct StreamManager {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    registry: Arc<AgentRegistry>,
    dispatcher: DispatchOrchestrator,
    transport: Arc<dyn Transport>,
}

impl StreamManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        dispatcher: DispatchOrchestrator,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            registry,
            dispatcher,
            transport,
        }
    }

    /// Create a session, announce it, and start consuming the backend stream
    /// in the background
    pub async fn start(&self, request: StreamRequest) -> Result<StreamHandle> {
        if request.message.trim().is_empty() {
            return Err(SwarmError::Validation("message must not be empty".into()));
        }
        let agent_name = self
            .registry
            .profile(&request.agent_id)
            .map(|p| p.name.clone())
            .ok_or_else(|| SwarmError::AgentNotFound(request.agent_id.clone()))?;

        let guard = self.dispatcher.tracker().begin(&request.agent_id)?;

        let session = StreamingSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            client_id: request.client_id.clone(),
            agent_id: request.agent_id.clone(),
            active: true,
            started_at: Utc::now(),
        };
        let token = CancellationToken::new();
        let session_id = session.session_id.clone();

        self.sessions.write().await.insert(
            session_id.clone(),
            SessionEntry {
                session,
                token: token.clone(),
            },
        );

        info!(
            "Stream session {} started: client={}, agent={}",
            session_id, request.client_id, request.agent_id
        );
        self.transport.emit(TransportEvent::to_client(
            &request.client_id,
            events::STREAM_START,
            json!({
                "session_id": session_id,
                "agent_id": request.agent_id,
                "agent_name": agent_name,
            }),
        ));

        let this = self.clone();
        let sid = session_id.clone();
        let agent_id = request.agent_id.clone();
        let task = tokio::spawn(async move { this.run_session(sid, request, guard, token).await });

        Ok(StreamHandle {
            session_id,
            agent_id,
            task,
        })
    }

    /// Ask a session to stop. Acknowledged immediately; the stream task
    /// stops at its next chunk.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        self.stop_matching(session_id, None).await
    }

    /// Like [`stop`](Self::stop), but only for a session `client_id` owns.
    /// Another client's session reads as not found.
    pub async fn stop_for_client(&self, session_id: &str, client_id: &str) -> Result<()> {
        self.stop_matching(session_id, Some(client_id)).await
    }

    async fn stop_matching(&self, session_id: &str, owner: Option<&str>) -> Result<()> {
        let client_id = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .filter(|e| owner.is_none_or(|o| e.session.client_id == o))
                .ok_or_else(|| SwarmError::SessionNotFound(session_id.to_string()))?;
            entry.session.active = false;
            entry.token.cancel();
            entry.session.client_id.clone()
        };

        info!("Stream session {} stop requested", session_id);
        self.transport.emit(TransportEvent::to_client(
            &client_id,
            events::STREAM_STOPPED,
            json!({"session_id": session_id}),
        ));
        Ok(())
    }

    /// Stop every session owned by a client. Returns how many were stopped.
    pub async fn stop_client(&self, client_id: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut stopped = 0;
        for entry in sessions.values_mut() {
            if entry.session.client_id == client_id && entry.session.active {
                entry.session.active = false;
                entry.token.cancel();
                stopped += 1;
            }
        }
        if stopped > 0 {
            debug!("Stopped {} stream session(s) for client {}", stopped, client_id);
        }
        stopped
    }

    pub async fn sessions(&self) -> Vec<StreamingSession> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<StreamingSession> =
            sessions.values().map(|e| e.session.clone()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub async fn get(&self, session_id: &str) -> Option<StreamingSession> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|e| e.session.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Open the backend stream, retrying transient failures
    async fn open(&self, request: &StreamRequest) -> std::result::Result<ChunkStream, BackendError> {
        let completion = self
            .dispatcher
            .completion_request(&request.agent_id, &request.message, request.model.clone())
            .await
            .map_err(|e| BackendError::ModelNotFound(e.to_string()))?;

        let call_timeout = self.dispatcher.config().call_timeout;
        let backend = self.dispatcher.backend();
        let req = &completion;
        let label = format!("stream[{}]", request.agent_id);
        self.dispatcher
            .retry_policy()
            .run(&label, |_| async move {
                match tokio::time::timeout(call_timeout, backend.stream(req)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(call_timeout)),
                }
            })
            .await
            .result
    }

    async fn run_session(
        &self,
        session_id: String,
        request: StreamRequest,
        guard: TaskGuard,
        token: CancellationToken,
    ) -> SessionState {
        let started = Instant::now();
        let call_timeout = self.dispatcher.config().call_timeout;
        let mut full_response = String::new();
        let mut index = 0usize;

        let terminal: std::result::Result<SessionState, BackendError> = async {
            let mut stream = self.open(&request).await?;
            debug!("Stream session {} streaming", session_id);

            loop {
                let next = match tokio::time::timeout(call_timeout, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => Some(Err(BackendError::Timeout(call_timeout))),
                };

                if token.is_cancelled() {
                    return Ok(SessionState::Cancelled);
                }

                match next {
                    None => return Ok(SessionState::Completed),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(chunk)) => {
                        full_response.push_str(&chunk);
                        self.transport.emit(TransportEvent::to_client(
                            &request.client_id,
                            events::STREAM_CHUNK,
                            json!({
                                "session_id": session_id,
                                "agent_id": request.agent_id,
                                "chunk": chunk,
                                "index": index,
                            }),
                        ));
                        index += 1;
                    }
                }
            }
        }
        .await;

        // The record never outlives the call it tracks
        self.sessions.write().await.remove(&session_id);

        let state = match terminal {
            Ok(SessionState::Completed) => {
                let elapsed = started.elapsed();
                guard.finish(TaskOutcome::Success { elapsed });
                self.transport.emit(TransportEvent::to_client(
                    &request.client_id,
                    events::STREAM_END,
                    json!({
                        "session_id": session_id,
                        "agent_id": request.agent_id,
                        "full_response": full_response,
                        "elapsed_ms": elapsed.as_millis() as u64,
                    }),
                ));

                let model = request
                    .model
                    .clone()
                    .or_else(|| self.registry.model_for(&request.agent_id))
                    .unwrap_or_default();
                let record = InteractionRecord::new(&request.agent_id, &request.message, &full_response)
                    .with_metadata("model", model)
                    .with_metadata("response_time", elapsed.as_secs_f64())
                    .with_metadata("session_id", session_id.as_str());
                self.dispatcher.remember(record).await;
                SessionState::Completed
            }
            Ok(_) => {
                guard.finish(TaskOutcome::Cancelled);
                self.transport.emit(TransportEvent::to_client(
                    &request.client_id,
                    events::STREAM_CANCELLED,
                    json!({
                        "session_id": session_id,
                        "agent_id": request.agent_id,
                        "partial_response": full_response,
                    }),
                ));
                SessionState::Cancelled
            }
            Err(e) => {
                warn!("Stream session {} failed: {}", session_id, e);
                guard.finish(TaskOutcome::Failure {
                    configuration_fault: e.is_configuration(),
                });
                self.transport.emit(TransportEvent::to_client(
                    &request.client_id,
                    events::STREAM_ERROR,
                    json!({
                        "session_id": session_id,
                        "agent_id": request.agent_id,
                        "error": e.sanitized(),
                    }),
                ));
                SessionState::Errored
            }
        };

        info!(
            "Stream session {} {} after {} chunk(s)",
            session_id, state, index
        );
        state
    }
}
