//! Shared types for swarm-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentProfile;

/// Live status of an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
    /// Excluded from selection entirely
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Error => write!(f, "error"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl AgentStatus {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "error" => Some(Self::Error),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Running per-agent counters feeding selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub total_tasks: u64,
    /// Never exceeds `total_tasks`
    pub successful_tasks: u64,
    /// Seconds, averaged over successful tasks
    pub average_response_time: f64,
    pub last_active: Option<DateTime<Utc>>,
}

impl PerformanceMetrics {
    /// Success rate as a percentage in [0, 100]
    pub fn success_rate(&self) -> f64 {
        self.successful_tasks as f64 / self.total_tasks.max(1) as f64 * 100.0
    }
}

/// Point-in-time copy of an agent record
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub profile: AgentProfile,
    pub status: AgentStatus,
    pub in_flight: u32,
    pub performance: PerformanceMetrics,
    pub success_rate: f64,
}

impl AgentSnapshot {
    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }
}

/// Aggregate view over the whole registry
#[derive(Debug, Clone, Serialize)]
pub struct SwarmStatus {
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_tasks_processed: u64,
    pub overall_success_rate: f64,
    pub agents: Vec<AgentSnapshot>,
}

/// Per-agent performance report
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub agent_id: String,
    pub agent_name: String,
    pub status: AgentStatus,
    pub model: String,
    pub performance: PerformanceMetrics,
    pub success_rate: f64,
}
