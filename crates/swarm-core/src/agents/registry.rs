//! Agent registry — the single source of truth for agent definitions,
//! live status, and performance metrics.
//!
//! Profiles are immutable after construction. Each record carries its own
//! lock around the mutable state, so concurrent tasks on different agents
//! never contend and tasks on the same agent serialize their updates.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use super::profile::AgentProfile;
use crate::error::{Result, SwarmError};
use crate::types::{AgentSnapshot, AgentStatus, PerformanceMetrics, PerformanceReport, SwarmStatus};

/// Mutable part of an agent record
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub status: AgentStatus,
    /// Tasks currently running against this agent
    pub in_flight: u32,
    pub performance: PerformanceMetrics,
}

struct AgentRecord {
    profile: AgentProfile,
    state: Mutex<AgentState>,
}

impl AgentRecord {
    fn lock(&self) -> MutexGuard<'_, AgentState> {
        // A panic while holding the lock leaves plain counters behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> AgentSnapshot {
        let state = self.lock().clone();
        AgentSnapshot {
            profile: self.profile.clone(),
            status: state.status,
            in_flight: state.in_flight,
            success_rate: state.performance.success_rate(),
            performance: state.performance,
        }
    }
}

/// Holds every configured agent in registration order
pub struct AgentRegistry {
    records: Vec<AgentRecord>,
    index: HashMap<String, usize>,
    default_model: String,
}

impl AgentRegistry {
    /// Build the registry from the static catalog.
    /// Rejects invalid profiles and duplicate ids.
    pub fn new(profiles: Vec<AgentProfile>, default_model: impl Into<String>) -> Result<Self> {
        let mut records = Vec::with_capacity(profiles.len());
        let mut index = HashMap::with_capacity(profiles.len());

        for profile in profiles {
            profile.validate()?;
            if index.contains_key(&profile.id) {
                return Err(SwarmError::Configuration(format!(
                    "duplicate agent id '{}'",
                    profile.id
                )));
            }
            index.insert(profile.id.clone(), records.len());
            records.push(AgentRecord {
                profile,
                state: Mutex::new(AgentState::default()),
            });
        }

        info!("AgentRegistry: initialized with {} agents", records.len());
        Ok(Self {
            records,
            index,
            default_model: default_model.into(),
        })
    }

    fn record(&self, id: &str) -> Option<&AgentRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    fn record_or_err(&self, id: &str) -> Result<&AgentRecord> {
        self.record(id)
            .ok_or_else(|| SwarmError::AgentNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Immutable profile of an agent
    pub fn profile(&self, id: &str) -> Option<&AgentProfile> {
        self.record(id).map(|r| &r.profile)
    }

    /// Profiles in registration order
    pub fn profiles(&self) -> impl Iterator<Item = &AgentProfile> {
        self.records.iter().map(|r| &r.profile)
    }

    /// Model id to call for the agent
    pub fn model_for(&self, id: &str) -> Option<String> {
        self.record(id)
            .map(|r| r.profile.model_or(&self.default_model).to_string())
    }

    pub fn get(&self, id: &str) -> Option<AgentSnapshot> {
        self.record(id).map(AgentRecord::snapshot)
    }

    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.record(id).map(|r| r.lock().status)
    }

    /// Snapshots of every agent, in registration order
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.records.iter().map(AgentRecord::snapshot).collect()
    }

    /// Administrative status change (e.g. taking an agent offline).
    /// Returns the previous status.
    pub fn set_status(&self, id: &str, status: AgentStatus) -> Result<AgentStatus> {
        let record = self.record_or_err(id)?;
        let mut state = record.lock();
        let previous = state.status;
        state.status = status;
        debug!("AgentRegistry: '{}' {} → {}", id, previous, status);
        Ok(previous)
    }

    /// Mark a task as started. Fails for unknown or offline agents.
    /// Returns the status before and after, read under the same lock.
    pub fn begin_task(&self, id: &str) -> Result<(AgentStatus, AgentStatus)> {
        let record = self.record_or_err(id)?;
        let mut state = record.lock();
        if state.status == AgentStatus::Offline {
            return Err(SwarmError::Validation(format!("agent '{}' is offline", id)));
        }
        let previous = state.status;
        state.in_flight += 1;
        state.status = AgentStatus::Busy;
        Ok((previous, state.status))
    }

    /// Run a mutation against one agent's state under its lock
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut AgentState) -> R) -> Result<R> {
        let record = self.record_or_err(id)?;
        let mut state = record.lock();
        Ok(f(&mut state))
    }

    pub fn performance(&self, id: &str) -> Option<PerformanceReport> {
        let record = self.record(id)?;
        let state = record.lock().clone();
        Some(PerformanceReport {
            agent_id: record.profile.id.clone(),
            agent_name: record.profile.name.clone(),
            status: state.status,
            model: record.profile.model_or(&self.default_model).to_string(),
            success_rate: state.performance.success_rate(),
            performance: state.performance,
        })
    }

    /// Totals across the whole swarm
    pub fn swarm_status(&self) -> SwarmStatus {
        let agents = self.snapshots();
        let total_tasks: u64 = agents.iter().map(|a| a.performance.total_tasks).sum();
        let successful: u64 = agents.iter().map(|a| a.performance.successful_tasks).sum();
        SwarmStatus {
            total_agents: agents.len(),
            active_agents: agents
                .iter()
                .filter(|a| a.status != AgentStatus::Offline)
                .count(),
            total_tasks_processed: total_tasks,
            overall_success_rate: successful as f64 / total_tasks.max(1) as f64 * 100.0,
            agents,
        }
    }
}
