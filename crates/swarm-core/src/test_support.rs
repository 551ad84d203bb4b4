//! Stub collaborators shared by the unit tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::agents::{AgentProfile, AgentRegistry, Capability};
use crate::backend::{ChunkStream, CompletionRequest, ModelBackend};
use crate::error::BackendError;
use crate::memory::{InteractionRecord, MemorySnippet, MemoryStore};
use crate::transport::{Transport, TransportEvent};

type Responder = dyn Fn(&CompletionRequest, u32) -> Result<String, BackendError> + Send + Sync;

/// Registry where every agent's model id equals its agent id, so backends
/// can tell agents apart by `request.model_id`.
pub fn registry(ids: &[&str]) -> Arc<AgentRegistry> {
    let profiles = ids
        .iter()
        .map(|id| {
            let mut p = AgentProfile::new(*id, capitalize(id))
                .with_capability(Capability::new("general", 0.5).with_tags(&["help"]));
            p.model = Some(id.to_string());
            p
        })
        .collect();
    Arc::new(AgentRegistry::new(profiles, "default-model").unwrap())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Backend driven by a closure. The second closure argument is the 1-based
/// call number across all requests.
pub struct ScriptedBackend {
    delay: Duration,
    calls: AtomicU32,
    responder: Box<Responder>,
}

impl ScriptedBackend {
    pub fn new(
        responder: impl Fn(&CompletionRequest, u32) -> Result<String, BackendError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            responder: Box::new(responder),
        }
    }

    /// Answers "<model> reply" for every request
    pub fn echo() -> Self {
        Self::new(|req, _| Ok(format!("{} reply", req.model_id)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(request, n)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        self.respond(request).await
    }

    /// Streams the response word by word
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let text = self.respond(request).await?;
        let chunks: Vec<Result<String, BackendError>> = text
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

/// Backend whose single stream is fed by the test through a channel
pub struct ChannelBackend {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<String, BackendError>>>>,
}

impl ChannelBackend {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<String, BackendError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl ModelBackend for ChannelBackend {
    fn provider_name(&self) -> &str {
        "channel"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, BackendError> {
        Err(BackendError::BadRequest("channel backend only streams".into()))
    }

    async fn stream(&self, _request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BackendError::Stream("stream already taken".into()))?;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// Keeps every emitted event
#[derive(Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingTransport {
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn named(&self, name: &str) -> Vec<TransportEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event == name)
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn emit(&self, event: TransportEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Memory that records stores and can be told to fail
#[derive(Default)]
pub struct RecordingMemory {
    pub stored: Mutex<Vec<InteractionRecord>>,
    pub snippets: Vec<MemorySnippet>,
    pub fail: bool,
}

impl RecordingMemory {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn stored(&self) -> Vec<InteractionRecord> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemoryStore for RecordingMemory {
    async fn store(&self, record: InteractionRecord) -> Result<()> {
        if self.fail {
            return Err(anyhow!("memory unavailable"));
        }
        self.stored.lock().unwrap().push(record);
        Ok(())
    }

    async fn cross_agent_context(
        &self,
        _message: &str,
        exclude_agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        if self.fail {
            return Err(anyhow!("memory unavailable"));
        }
        Ok(self
            .snippets
            .iter()
            .filter(|s| s.agent_id != exclude_agent_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
