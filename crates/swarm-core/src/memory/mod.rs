//! Memory collaborator — long-term recall shared between agents
//!
//! Failures here are never fatal to a task. Callers log and move on.

pub mod local;
pub mod supermemory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use local::LocalMemory;
pub use supermemory::SupermemoryClient;

/// Snippets pulled into a prompt by default
pub const DEFAULT_CONTEXT_LIMIT: usize = 5;
/// Rendered context is capped at this many characters
pub const DEFAULT_CONTEXT_CHARS: usize = 1000;
/// Each snippet's content is cut to this many characters
const SNIPPET_CHARS: usize = 200;

/// One completed exchange with an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub agent_id: String,
    pub user_message: String,
    pub response: String,
    /// e.g. conversation_id, model, response_time
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl InteractionRecord {
    pub fn new(
        agent_id: impl Into<String>,
        user_message: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_message: user_message.into(),
            response: response.into(),
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A ranked piece of recalled context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemorySnippet {
    pub agent_id: String,
    pub content: String,
    pub timestamp: Option<String>,
    pub score: f64,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist an interaction
    async fn store(&self, record: InteractionRecord) -> Result<()>;

    /// Relevant snippets from other agents, best first
    async fn cross_agent_context(
        &self,
        message: &str,
        exclude_agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>>;
}

/// Memory disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemory;

#[async_trait]
impl MemoryStore for NoopMemory {
    async fn store(&self, _record: InteractionRecord) -> Result<()> {
        Ok(())
    }

    async fn cross_agent_context(
        &self,
        _message: &str,
        _exclude_agent_id: &str,
        _limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        Ok(Vec::new())
    }
}

/// Render snippets into a prompt section, stopping before `max_len` is exceeded.
/// Returns an empty string when there is nothing to show.
pub fn format_memory_context(snippets: &[MemorySnippet], max_len: usize) -> String {
    if snippets.is_empty() {
        return String::new();
    }

    let header = "Previous relevant conversations:\n";
    let mut out = String::from(header);

    for snippet in snippets {
        let content: String = if snippet.content.chars().count() > SNIPPET_CHARS {
            let cut: String = snippet.content.chars().take(SNIPPET_CHARS).collect();
            format!("{}...", cut)
        } else {
            snippet.content.clone()
        };
        let line = format!(
            "[{} - {}]: {}\n",
            snippet.agent_id,
            snippet.timestamp.as_deref().unwrap_or("unknown"),
            content
        );
        if out.len() + line.len() > max_len {
            break;
        }
        out.push_str(&line);
    }

    if out.len() == header.len() {
        return String::new();
    }
    out
}
