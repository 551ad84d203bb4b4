//! Mention parsing — extracts explicit `@agent` targets from message text

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::agents::AgentProfile;

/// `@` followed by an identifier. The marker must start the text or follow a
/// non-word character, so `alice@coder.dev` is not a mention.
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9_-]+)").expect("mention regex is valid")
});

/// Raw identifiers following a mention marker, lowercased, in order of appearance
pub fn mention_tokens(text: &str) -> Vec<String> {
    MENTION_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Resolve mentions against the agent catalog.
///
/// A token matches an agent when it equals the agent id or is a prefix of
/// the agent's display name (case-insensitive). Unknown tokens are ignored.
/// Result is deduplicated and ordered by first mention.
pub fn parse_mentions<'a>(
    text: &str,
    agents: impl IntoIterator<Item = &'a AgentProfile>,
) -> Vec<String> {
    let tokens = mention_tokens(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let agents: Vec<&AgentProfile> = agents.into_iter().collect();
    let mut seen = HashSet::new();
    let mut ids = Vec::new();

    for token in &tokens {
        let matched = agents
            .iter()
            .find(|a| a.id.to_lowercase() == *token)
            .or_else(|| {
                agents
                    .iter()
                    .find(|a| a.name.to_lowercase().starts_with(token.as_str()))
            });

        if let Some(agent) = matched {
            if seen.insert(agent.id.clone()) {
                ids.push(agent.id.clone());
            }
        }
    }

    debug!("Parsed mentions {:?} → agents {:?}", tokens, ids);
    ids
}
