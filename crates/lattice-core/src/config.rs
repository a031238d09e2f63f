use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};

/// Top-level Lattice configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Which backend kind serves inference by default.
///
/// Decided once at startup; a model id prefix can still force a specific
/// hosted kind per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Locally hosted Ollama server.
    #[default]
    Local,
    /// Hosted API (Groq by default).
    Hosted,
}

/// Model role played by a step. Maps to a concrete model id via
/// [`LlmConfig::model_for_role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Reasoning,
    Writing,
    Coding,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub mode: BackendMode,
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    /// Ordered credential list for Groq; the rotation cursor walks this.
    #[serde(default)]
    pub groq_api_keys: Vec<String>,
    #[serde(default)]
    pub openrouter_api_keys: Vec<String>,
    #[serde(default = "default_model_reasoning")]
    pub model_reasoning: String,
    #[serde(default = "default_model_writing")]
    pub model_writing: String,
    #[serde(default = "default_model_coding")]
    pub model_coding: String,
    #[serde(default = "default_model_critical")]
    pub model_critical: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            ollama_base_url: default_ollama_base_url(),
            groq_api_keys: Vec::new(),
            openrouter_api_keys: Vec::new(),
            model_reasoning: default_model_reasoning(),
            model_writing: default_model_writing(),
            model_coding: default_model_coding(),
            model_critical: default_model_critical(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    pub fn model_for_role(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Reasoning => &self.model_reasoning,
            ModelRole::Writing => &self.model_writing,
            ModelRole::Coding => &self.model_coding,
            ModelRole::Critical => &self.model_critical,
        }
    }
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model_reasoning() -> String {
    "phi3:mini".to_string()
}
fn default_model_writing() -> String {
    "gemma2:2b".to_string()
}
fn default_model_coding() -> String {
    "qwen2.5-coder:1.5b".to_string()
}
fn default_model_critical() -> String {
    "phi3:mini".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.7
}

/// Context-window budgeting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Token window allotted to a step's input context.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Tokens held back for the system prompt and response headroom.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            reserve_tokens: default_reserve_tokens(),
        }
    }
}

fn default_max_context_tokens() -> usize {
    4096
}
fn default_reserve_tokens() -> usize {
    500
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// SQLite path. None = in-memory (no persistence across restarts).
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            path: None,
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}

/// Session state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite path. None = in-memory fallback from the start.
    #[serde(default)]
    pub path: Option<String>,
    /// Per-entry TTL. Default: 24h.
    #[serde(default = "default_store_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: default_store_ttl_secs(),
        }
    }
}

fn default_store_ttl_secs() -> u64 {
    86_400
}

/// Document mutation lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: default_lock_timeout_secs(),
            poll_interval_ms: default_lock_poll_ms(),
        }
    }
}

fn default_lock_timeout_secs() -> u64 {
    60
}
fn default_lock_poll_ms() -> u64 {
    100
}

/// Progression gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Sleep between polls of the session store while the gate is unsatisfied.
    #[serde(default = "default_gate_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_gate_poll_ms(),
        }
    }
}

fn default_gate_poll_ms() -> u64 {
    2_000
}

/// Retry configuration for rate-limited provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_max_backoff() -> u64 {
    30_000
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for run logs. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LatticeError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| LatticeError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_LATTICE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_LATTICE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_LATTICE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_LATTICE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_LATTICE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.llm.mode, BackendMode::Local);
        assert_eq!(config.llm.ollama_base_url, "http://localhost:11434");
        assert_eq!(config.budget.max_context_tokens, 4096);
        assert_eq!(config.lock.acquire_timeout_secs, 60);
        assert_eq!(config.store.ttl_secs, 86_400);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_hosted_mode_with_keys() {
        let toml_str = r#"
[llm]
mode = "hosted"
groq_api_keys = ["k1", "k2", "k3"]
model_reasoning = "llama-3.3-70b-versatile"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.llm.mode, BackendMode::Hosted);
        assert_eq!(config.llm.groq_api_keys.len(), 3);
        assert_eq!(
            config.llm.model_for_role(ModelRole::Reasoning),
            "llama-3.3-70b-versatile"
        );
        // Unspecified roles keep their defaults.
        assert_eq!(config.llm.model_for_role(ModelRole::Writing), "gemma2:2b");
    }
}
