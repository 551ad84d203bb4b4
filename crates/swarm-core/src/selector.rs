//! Agent selection — capability-weighted scoring for messages without mentions
//!
//! Score = 0.6 × mean confidence of matching capabilities
//!       + 0.3 × success rate
//!       + 0.1 if the agent is idle

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agents::AgentRegistry;
use crate::types::{AgentSnapshot, AgentStatus};

const CAPABILITY_WEIGHT: f64 = 0.6;
const PERFORMANCE_WEIGHT: f64 = 0.3;
const AVAILABILITY_BONUS: f64 = 0.1;

/// What to do when no agent's capabilities match the message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Pick the highest total score anyway (performance and availability only)
    #[default]
    BestScore,
    /// Return no agent
    Reject,
    /// Route to a fixed agent, if it is not offline
    Agent(String),
}

/// One scored candidate
#[derive(Debug, Clone)]
pub struct ScoredAgent {
    pub agent: AgentSnapshot,
    pub capability_score: f64,
    pub score: f64,
}

/// Lowercased word set of a message
pub fn message_keywords(message: &str) -> HashSet<String> {
    message
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct AgentSelector {
    fallback: FallbackPolicy,
}

impl AgentSelector {
    pub fn new(fallback: FallbackPolicy) -> Self {
        Self { fallback }
    }

    pub fn fallback(&self) -> &FallbackPolicy {
        &self.fallback
    }

    /// Score every non-offline agent. Sorted by descending score; equal scores
    /// keep registration order.
    pub fn rank(
        &self,
        registry: &AgentRegistry,
        message: &str,
        required_tags: &[String],
    ) -> Vec<ScoredAgent> {
        let keywords = message_keywords(message);
        let required: HashSet<String> = required_tags.iter().map(|t| t.to_lowercase()).collect();

        let mut scored: Vec<ScoredAgent> = registry
            .snapshots()
            .into_iter()
            .filter(|a| a.status != AgentStatus::Offline)
            .map(|agent| {
                let capability_score = capability_score(&agent, &keywords, &required);
                let mut score = CAPABILITY_WEIGHT * capability_score
                    + PERFORMANCE_WEIGHT * (agent.success_rate / 100.0);
                if agent.status == AgentStatus::Idle {
                    score += AVAILABILITY_BONUS;
                }
                ScoredAgent {
                    agent,
                    capability_score,
                    score,
                }
            })
            .collect();

        // Stable sort keeps registration order for ties
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    /// Pick the best agent for a message, or `None` if nobody is eligible
    pub fn select(
        &self,
        registry: &AgentRegistry,
        message: &str,
        required_tags: &[String],
    ) -> Option<AgentSnapshot> {
        let ranked = self.rank(registry, message, required_tags);
        let best = ranked.into_iter().next()?;

        if best.capability_score > 0.0 {
            debug!(
                "Selected agent '{}' (score {:.3}, capability {:.3})",
                best.agent.id(),
                best.score,
                best.capability_score
            );
            return Some(best.agent);
        }

        match &self.fallback {
            FallbackPolicy::BestScore => {
                debug!(
                    "No capability match, falling back to best score: '{}' ({:.3})",
                    best.agent.id(),
                    best.score
                );
                Some(best.agent)
            }
            FallbackPolicy::Reject => {
                debug!("No capability match and fallback is 'reject'");
                None
            }
            FallbackPolicy::Agent(id) => match registry.get(id) {
                Some(agent) if agent.status != AgentStatus::Offline => {
                    debug!("No capability match, falling back to '{}'", id);
                    Some(agent)
                }
                Some(_) => {
                    warn!("Fallback agent '{}' is offline", id);
                    None
                }
                None => {
                    warn!("Fallback agent '{}' is not registered", id);
                    None
                }
            },
        }
    }
}

fn capability_score(
    agent: &AgentSnapshot,
    keywords: &HashSet<String>,
    required: &HashSet<String>,
) -> f64 {
    let matched: Vec<f64> = agent
        .profile
        .capabilities
        .iter()
        .filter(|c| c.matches_keywords(keywords) || required.contains(&c.name.to_lowercase()))
        .map(|c| c.confidence)
        .collect();

    if matched.is_empty() {
        0.0
    } else {
        matched.iter().sum::<f64>() / matched.len() as f64
    }
}
