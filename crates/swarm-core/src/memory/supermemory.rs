//! Supermemory HTTP client

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{InteractionRecord, MemorySnippet, MemoryStore};

pub const SUPERMEMORY_BASE_URL: &str = "https://api.supermemory.ai";

/// Minimum similarity for cross-agent recall
const CONTEXT_THRESHOLD: f64 = 0.6;

pub struct SupermemoryClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for SupermemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupermemoryClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .finish()
    }
}

impl SupermemoryClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(anyhow!("Supermemory API key is empty"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn store_payload(record: &InteractionRecord) -> Value {
        let timestamp = record.timestamp.to_rfc3339();
        let model = record
            .metadata
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let content = format!(
            "Agent: {}\nUser: {}\nAssistant: {}\nModel: {}\nTimestamp: {}",
            record.agent_id, record.user_message, record.response, model, timestamp
        );

        let mut tags = vec![format!("agent:{}", record.agent_id)];
        for (key, value) in &record.metadata {
            match value {
                Value::String(s) => tags.push(format!("{}:{}", key, s)),
                Value::Null => {}
                other => tags.push(format!("{}:{}", key, other)),
            }
        }

        let mut metadata = record.metadata.clone();
        metadata.insert("agent_id".into(), json!(record.agent_id));
        metadata.insert("timestamp".into(), json!(timestamp));

        json!({
            "content": content,
            "title": format!("Conversation with {}", record.agent_id),
            "tags": tags,
            "metadata": metadata,
        })
    }
}

#[async_trait]
impl MemoryStore for SupermemoryClient {
    async fn store(&self, record: InteractionRecord) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/add", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Self::store_payload(&record))
            .send()
            .await
            .context("Failed to send request to Supermemory")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Supermemory store failed with status {}", status));
        }
        debug!("Supermemory: stored conversation for agent {}", record.agent_id);
        Ok(())
    }

    async fn cross_agent_context(
        &self,
        message: &str,
        exclude_agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        let body = json!({
            "query": message,
            "limit": limit,
            "threshold": CONTEXT_THRESHOLD,
            "filters": {"exclude_agent": exclude_agent_id},
        });

        let response = self
            .client
            .post(format!("{}/api/search", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Supermemory")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Supermemory search failed with status {}", status));
        }

        let results: SearchResponse = response
            .json()
            .await
            .context("Failed to parse Supermemory search response")?;
        let snippets = into_snippets(results, exclude_agent_id, limit);
        info!("Supermemory: {} cross-agent memories", snippets.len());
        Ok(snippets)
    }
}

/// Drop hits from the excluded agent; the server-side filter is advisory
fn into_snippets(results: SearchResponse, exclude_agent_id: &str, limit: usize) -> Vec<MemorySnippet> {
    results
        .results
        .into_iter()
        .filter_map(|hit| {
            let agent_id = hit
                .metadata
                .get("agent_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            if agent_id == exclude_agent_id {
                return None;
            }
            let timestamp = hit
                .metadata
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(MemorySnippet {
                agent_id,
                content: hit.content.unwrap_or_default(),
                timestamp,
                score: hit.score,
            })
        })
        .take(limit)
        .collect()
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    metadata: serde_json::Map<String, Value>,
}
