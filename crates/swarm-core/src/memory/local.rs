//! In-process memory with keyword-overlap recall

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tracing::debug;

use super::{InteractionRecord, MemorySnippet, MemoryStore};
use crate::selector::message_keywords;

const DEFAULT_CAPACITY: usize = 500;

/// Keeps the most recent interactions in memory. Oldest entries are evicted
/// once `capacity` is reached.
pub struct LocalMemory {
    records: Mutex<VecDeque<InteractionRecord>>,
    capacity: usize,
}

impl Default for LocalMemory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MemoryStore for LocalMemory {
    async fn store(&self, record: InteractionRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("local memory lock poisoned"))?;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        debug!("LocalMemory: stored interaction for '{}'", record.agent_id);
        records.push_back(record);
        Ok(())
    }

    async fn cross_agent_context(
        &self,
        message: &str,
        exclude_agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        let query = message_keywords(message);
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let records = self
            .records
            .lock()
            .map_err(|_| anyhow!("local memory lock poisoned"))?;

        let mut scored: Vec<MemorySnippet> = records
            .iter()
            .rev()
            .filter(|r| r.agent_id != exclude_agent_id)
            .filter_map(|r| {
                let words = message_keywords(&format!("{} {}", r.user_message, r.response));
                let overlap = query.iter().filter(|w| words.contains(*w)).count();
                if overlap == 0 {
                    return None;
                }
                Some(MemorySnippet {
                    agent_id: r.agent_id.clone(),
                    content: format!("User: {}\nAssistant: {}", r.user_message, r.response),
                    timestamp: Some(r.timestamp.to_rfc3339()),
                    score: overlap as f64 / query.len() as f64,
                })
            })
            .collect();

        // Newest first among equal scores
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }
}
