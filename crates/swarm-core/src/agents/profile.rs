//! Agent profile — identity, persona, model, and capabilities of one agent

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Result, SwarmError};

/// A named, tagged skill with a confidence score used for selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            confidence,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// True if any tag appears in the (lowercased) keyword set
    pub fn matches_keywords(&self, keywords: &HashSet<String>) -> bool {
        self.tags
            .iter()
            .any(|tag| keywords.contains(&tag.to_lowercase()))
    }
}

/// An agent profile defines one persona bound to a backend model.
/// Loaded once from the static catalog and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    /// Injected as the system instruction
    #[serde(default)]
    pub personality: String,
    /// Falls back to the backend default when unset
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: String::new(),
            personality: String::new(),
            model: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// The model to call for this agent
    pub fn model_or<'a>(&'a self, default_model: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default_model)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SwarmError::Configuration("agent id must not be empty".into()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SwarmError::Configuration(format!(
                "agent id '{}' may only contain letters, digits, '_' and '-'",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(SwarmError::Configuration(format!(
                "agent '{}' has an empty name",
                self.id
            )));
        }
        for cap in &self.capabilities {
            if !(0.0..=1.0).contains(&cap.confidence) {
                return Err(SwarmError::Configuration(format!(
                    "capability '{}' of agent '{}' has confidence {} outside [0, 1]",
                    cap.name, self.id, cap.confidence
                )));
            }
        }
        Ok(())
    }

    /// Build the system instruction, optionally extended with cross-agent context
    pub fn system_prompt(&self, context: Option<&str>) -> String {
        let mut prompt = if self.role.is_empty() {
            format!("You are {}.", self.name)
        } else {
            format!("You are {}, a {}.", self.name, self.role)
        };

        if !self.personality.is_empty() {
            prompt.push_str(&format!("\n\nPersonality: {}", self.personality));
        }

        if !self.capabilities.is_empty() {
            let names: Vec<&str> = self.capabilities.iter().map(|c| c.name.as_str()).collect();
            prompt.push_str(&format!("\n\nCapabilities: {}", names.join(", ")));
        }

        prompt.push_str(
            "\n\nRespond in character, being helpful and leveraging your specific expertise.\n\
             Keep responses concise but informative.",
        );

        if let Some(context) = context.filter(|c| !c.is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(context);
        }

        prompt
    }
}
