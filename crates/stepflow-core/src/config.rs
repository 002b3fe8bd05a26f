use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};

/// Top-level Stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// JSON-RPC endpoints keyed by agent id.
    #[serde(default)]
    pub agents: HashMap<String, AgentEndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Network timeout for a single agent call attempt.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Where the SQLite database lives.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_call_timeout() -> u64 { 30 }
fn default_data_dir() -> String { "~/.stepflow".to_string() }

/// Retry policy for agent calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Scale each backoff by a random factor in 0.8..1.2.
    #[serde(default)]
    pub jitter: bool,
    /// Do not retry `InvalidParams` failures.
    #[serde(default = "default_fail_fast")]
    pub fail_fast_on_invalid_params: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: false,
            fail_fast_on_invalid_params: default_fail_fast(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_base_delay() -> u64 { 1000 }
fn default_max_delay() -> u64 { 30000 }
fn default_fail_fast() -> bool { true }

/// Defaults applied to every lazily created circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures in CLOSED before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN before the circuit closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds after the last failure before a recovery probe is allowed.
    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,
    /// Track (agent, method) pairs separately instead of whole agents.
    #[serde(default = "default_per_method")]
    pub per_method: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_breaker_timeout(),
            per_method: default_per_method(),
        }
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_success_threshold() -> u32 { 2 }
fn default_breaker_timeout() -> u64 { 60 }
fn default_per_method() -> bool { true }

/// Where and how to reach one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Overrides `engine.call_timeout_secs` for this agent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            return Err(StepflowError::Config(
                "retry.max_retries must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(StepflowError::Config(
                "circuit_breaker thresholds must be at least 1".into(),
            ));
        }
        if self.engine.call_timeout_secs == 0 {
            return Err(StepflowError::Config(
                "engine.call_timeout_secs must be at least 1".into(),
            ));
        }
        for (agent_id, endpoint) in &self.agents {
            if endpoint.timeout_secs == Some(0) {
                return Err(StepflowError::Config(format!(
                    "agents.{}.timeout_secs must be at least 1",
                    agent_id
                )));
            }
        }
        Ok(())
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        let dir = &self.engine.data_dir;
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("stepflow.db")
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

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
