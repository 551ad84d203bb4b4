use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use swarm_core::backend::openai::OPENROUTER_BASE_URL;
use swarm_core::memory::supermemory::SUPERMEMORY_BASE_URL;
use swarm_core::{
    AgentProfile, AgentRegistry, CompletionOptions, DispatchConfig, FallbackPolicy, RetryPolicy,
    SwarmOptions,
};
use tracing::warn;

/// The config file shipped with the binary, written by `swarm init`
pub const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct SwarmConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

// ── Backend Config ──────────────────────────────────────────────

#[derive(Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("provider", &self.provider)
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_provider() -> String {
    "openrouter".to_string()
}
fn default_backend_base_url() -> String {
    OPENROUTER_BASE_URL.to_string()
}
fn default_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

// ── Memory Config ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    None,
    #[default]
    Local,
    Supermemory,
}

#[derive(Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub kind: MemoryKind,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_memory_base_url")]
    pub base_url: String,
    /// Interactions kept by the local store
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
}

impl std::fmt::Debug for MemoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConfig")
            .field("kind", &self.kind)
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn default_memory_base_url() -> String {
    SUPERMEMORY_BASE_URL.to_string()
}
fn default_memory_capacity() -> usize {
    500
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            kind: MemoryKind::default(),
            api_key: String::new(),
            base_url: default_memory_base_url(),
            capacity: default_memory_capacity(),
        }
    }
}

// ── Dispatch Config ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    #[serde(default = "default_max_targets_per_request")]
    pub max_targets_per_request: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub batch_timeout_secs: Option<u64>,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_max_concurrent_dispatches() -> usize {
    8
}
fn default_max_targets_per_request() -> usize {
    10
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_context_limit() -> usize {
    5
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            max_targets_per_request: default_max_targets_per_request(),
            call_timeout_secs: default_call_timeout_secs(),
            batch_timeout_secs: None,
            context_limit: default_context_limit(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ── Selection & Gateway Config ──────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub fallback: FallbackPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    /// Broadcast buffer per connected client before it starts lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_gateway_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_event_capacity() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".swarm")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl SwarmConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path.clone().unwrap_or_else(default_config_path);

        // Refuse to start if group or other can read a file that may hold keys
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `swarm init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Parse config text, expanding allowlisted environment variables first
    pub fn parse(content: &str) -> Result<Self> {
        warn_hardcoded_secrets(content);
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        Ok(config)
    }

    pub fn registry(&self) -> Result<AgentRegistry> {
        AgentRegistry::new(self.agents.clone(), self.backend.default_model.clone())
            .context("Invalid agent catalog")
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let d = &self.dispatch;
        DispatchConfig {
            max_concurrent_dispatches: d.max_concurrent_dispatches,
            max_targets_per_request: d.max_targets_per_request,
            call_timeout: Duration::from_secs(d.call_timeout_secs),
            batch_timeout: d.batch_timeout_secs.map(Duration::from_secs),
            context_limit: d.context_limit,
            options: CompletionOptions {
                temperature: self.backend.temperature,
                max_tokens: self.backend.max_tokens,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.dispatch.retry;
        RetryPolicy::default()
            .with_max_attempts(r.max_attempts)
            .with_base_delay(Duration::from_millis(r.base_delay_ms))
            .with_max_delay(Duration::from_millis(r.max_delay_ms))
    }

    pub fn swarm_options(&self) -> SwarmOptions {
        SwarmOptions {
            dispatch: self.dispatch_config(),
            retry: self.retry_policy(),
            fallback: self.selection.fallback.clone(),
        }
    }
}

/// Warn about keys written directly into the file instead of `${VAR}` references
fn warn_hardcoded_secrets(raw: &str) {
    let Ok(table) = raw.parse::<toml::Table>() else {
        return;
    };
    for (section, var) in [("backend", "OPENROUTER_API_KEY"), ("memory", "SUPERMEMORY_API_KEY")] {
        let key = table
            .get(section)
            .and_then(|s| s.get("api_key"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !key.is_empty() && !key.contains("${") {
            warn!(
                "[{}] api_key is hardcoded in config file. For security, use environment variables: api_key = \"${{{}}}\"",
                section, var
            );
        }
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "OPENROUTER_API_KEY",
    "OPENAI_API_KEY",
    "SUPERMEMORY_API_KEY",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Left verbatim so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[backend]
api_key = "${OPENROUTER_API_KEY}"

[[agents]]
id = "cathy"
name = "Cathy"
"#;

    #[test]
    fn test_bundled_default_config() {
        let config = SwarmConfig::parse(DEFAULT_CONFIG).unwrap();
        let ids: Vec<&str> = config.agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["comms", "cathy", "dataminer", "coder", "creative", "researcher"]
        );
        assert!(!config.backend.api_key.contains("${"));

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.model_for("coder").as_deref(), Some("anthropic/claude-3.5-sonnet"));
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = SwarmConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.backend.provider, "openrouter");
        assert_eq!(config.memory.kind, MemoryKind::Local);
        assert_eq!(config.selection.fallback, FallbackPolicy::BestScore);
        assert_eq!(config.gateway.bind, "127.0.0.1:8080");

        let dispatch = config.dispatch_config();
        assert_eq!(dispatch.max_concurrent_dispatches, 8);
        assert_eq!(dispatch.max_targets_per_request, 10);
        assert_eq!(dispatch.call_timeout, Duration::from_secs(60));
        assert!(dispatch.batch_timeout.is_none());

        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_overrides_and_fallback_agent() {
        let raw = format!(
            "{}\n{}",
            MINIMAL,
            r#"
[dispatch]
max_concurrent_dispatches = 2
batch_timeout_secs = 30

[dispatch.retry]
max_attempts = 5
base_delay_ms = 100

[selection]
fallback = { agent = "cathy" }

[memory]
kind = "none"
"#
        );
        let config = SwarmConfig::parse(&raw).unwrap();
        assert_eq!(config.dispatch.max_concurrent_dispatches, 2);
        assert_eq!(config.dispatch_config().batch_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.selection.fallback, FallbackPolicy::Agent("cathy".into()));
        assert_eq!(config.memory.kind, MemoryKind::None);
    }

    #[test]
    fn test_fallback_reject() {
        let raw = format!("{}\n[selection]\nfallback = \"reject\"\n", MINIMAL);
        let config = SwarmConfig::parse(&raw).unwrap();
        assert_eq!(config.selection.fallback, FallbackPolicy::Reject);
    }

    #[test]
    fn test_invalid_catalog_rejected() {
        let raw = r#"
[backend]

[[agents]]
id = "a"
name = "A"
capabilities = [{ name = "x", confidence = 1.5 }]
"#;
        let config = SwarmConfig::parse(raw).unwrap();
        assert!(config.registry().is_err());
    }

    #[test]
    fn test_expand_env_vars_allowlist() {
        let out = expand_env_vars("key = \"${NOT_ALLOWED_VAR}\"");
        assert_eq!(out, "key = \"${NOT_ALLOWED_VAR}\"");

        let out = expand_env_vars("home = \"${HOME}\" next = \"${NOT_ALLOWED_VAR}\"");
        assert!(!out.contains("${HOME}"));
        assert!(out.contains("${NOT_ALLOWED_VAR}"));

        assert_eq!(expand_env_vars("unterminated ${HOME"), "unterminated ${HOME");
    }

    #[test]
    fn test_gateway_token_not_expandable() {
        // The gateway has no token auth, so nothing may pull this in
        let out = expand_env_vars("token = \"${SWARM_GATEWAY_TOKEN}\"");
        assert_eq!(out, "token = \"${SWARM_GATEWAY_TOKEN}\"");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-or-v1-abcdef123456"), "sk-...3456");
    }

    #[test]
    fn test_debug_masks_keys() {
        let raw = r#"
[backend]
api_key = "sk-or-v1-supersecretvalue"

[memory]
kind = "supermemory"
api_key = "sm-anothersecretvalue"
"#;
        let config = SwarmConfig::parse(raw).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("supersecret"));
        assert!(!debug.contains("anothersecret"));
        assert!(debug.contains("sk-...alue"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = SwarmConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].id, "cathy");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SwarmConfig::load(&Some(dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("swarm init"));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = SwarmConfig::load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("permissive"));
    }
}
