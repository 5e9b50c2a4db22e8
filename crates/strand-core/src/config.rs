use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Top-level Strand configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub containers: ContainerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub persistence: Option<PersistenceConfig>,
    #[serde(default)]
    pub command: Option<CommandConfig>,
}

/// Scheduler ceilings and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_execution_steps")]
    pub max_execution_steps: usize,
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_command_poll_interval_ms")]
    pub command_poll_interval_ms: u64,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_execution_steps: default_max_execution_steps(),
            max_execution_time_secs: default_max_execution_time_secs(),
            max_workers: default_max_workers(),
            command_poll_interval_ms: default_command_poll_interval_ms(),
            max_call_depth: default_max_call_depth(),
        }
    }
}

impl EngineConfig {
    pub fn limits(&self) -> EngineLimits {
        EngineLimits {
            max_execution_steps: self.max_execution_steps,
            max_execution_time: Duration::from_secs(self.max_execution_time_secs),
            max_workers: self.max_workers.max(1),
            command_poll_interval: Duration::from_millis(self.command_poll_interval_ms.max(1)),
        }
    }
}

/// Hard ceilings checked by the scheduler at every dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub max_execution_steps: usize,
    pub max_execution_time: Duration,
    pub max_workers: usize,
    pub command_poll_interval: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        EngineConfig::default().limits()
    }
}

impl EngineLimits {
    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_execution_steps = steps;
        self
    }

    pub fn with_max_time(mut self, time: Duration) -> Self {
        self.max_execution_time = time;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Upper bound on loop passes regardless of a node's own `loop_count`.
    #[serde(default = "default_container_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_parallel_iterations")]
    pub max_parallel_iterations: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_container_max_iterations(),
            max_parallel_iterations: default_max_parallel_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_agent_max_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// Runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for JSONL run logs. Default: ./strand-logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary, 2 = per node, 3 = every chunk.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(self.log_dir.as_deref().unwrap_or("strand-logs"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_command_key_prefix")]
    pub key_prefix: String,
}

/// Model selection for LLM-bearing nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(alias = "name")]
    pub model_id: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            max_tokens: None,
            temperature: None,
            stop: vec![],
        }
    }
}

fn default_max_execution_steps() -> usize { 500 }
fn default_max_execution_time_secs() -> u64 { 1200 }
fn default_max_workers() -> usize { 10 }
fn default_command_poll_interval_ms() -> u64 { 100 }
fn default_max_call_depth() -> usize { 5 }
fn default_container_max_iterations() -> usize { 100 }
fn default_max_parallel_iterations() -> usize { 10 }
fn default_agent_max_iterations() -> usize { 10 }
fn default_tool_timeout_secs() -> u64 { 30 }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }
fn default_command_key_prefix() -> String { "strand:commands".to_string() }
fn default_provider() -> String { "default".to_string() }

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
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
        std::env::set_var("TEST_STRAND_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STRAND_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STRAND_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STRAND_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STRAND_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_execution_steps, 500);
        assert_eq!(config.engine.max_execution_time_secs, 1200);
        assert_eq!(config.engine.max_workers, 10);
        assert_eq!(config.containers.max_iterations, 100);
        assert_eq!(config.agent.max_iterations, 10);
        assert!(config.log.is_none());
        assert!(config.persistence.is_none());
    }

    #[test]
    fn test_limits_clamp_workers() {
        let config = EngineConfig {
            max_workers: 0,
            ..EngineConfig::default()
        };
        let limits = config.limits();
        assert_eq!(limits.max_workers, 1);
        assert_eq!(limits.max_execution_time, Duration::from_secs(1200));
    }

    #[test]
    fn test_model_config_accepts_name_alias() {
        let model: ModelConfig = serde_json::from_value(serde_json::json!({
            "provider": "openai",
            "name": "gpt-4o"
        }))
        .unwrap();
        assert_eq!(model.model_id, "gpt-4o");
        assert!(model.stop.is_empty());
    }
}
