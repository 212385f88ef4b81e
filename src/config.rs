//! Layered configuration: defaults -> `devpilot.yaml` -> `devpilot.local.yaml`
//! -> `DEVPILOT_`-prefixed environment variables.

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_concurrent must be a positive integer, got {0}")]
    InvalidMaxConcurrent(usize),

    #[error("agent_timeout_seconds must be positive, got {0}")]
    InvalidAgentTimeout(u64),

    #[error("agent_max_retries must be at least 1, got {0}")]
    InvalidAgentMaxRetries(u32),

    #[error("agent_path cannot be empty")]
    EmptyAgentPath,

    #[error("branch_template must contain {{issue_number}}: {0}")]
    InvalidBranchTemplate(String),

    #[error("trigger_label cannot be empty")]
    EmptyTriggerLabel,

    #[error("trigger_command cannot be empty")]
    EmptyTriggerCommand,

    #[error("repository.default_branch cannot be empty")]
    EmptyDefaultBranch,

    #[error("database.path cannot be empty")]
    EmptyDatabasePath,

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("failed to extract configuration: {0}")]
    Extraction(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub default_branch: String,
    pub remote: String,
    pub path: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            remote: "origin".to_string(),
            path: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    Daily,
    Hourly,
    Never,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::Daily
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    pub log_dir: Option<String>,
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub rotation: RotationPolicy,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            enable_stdout: true,
            rotation: RotationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".devpilot/devpilot.db".to_string(),
        }
    }
}

/// Fully-validated runtime configuration. `spec.md` §6's keys plus the
/// ambient `logging`/`database` sections needed to start the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub max_concurrent: usize,
    pub agent_timeout_seconds: u64,
    pub agent_max_retries: u32,
    pub agent_path: String,
    pub agent_skip_permissions: bool,
    pub branch_template: String,
    pub commit_template: String,
    pub trigger_label: String,
    pub trigger_command: String,
    pub repository: RepositoryConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            agent_timeout_seconds: 1800,
            agent_max_retries: 2,
            agent_path: "claude".to_string(),
            agent_skip_permissions: false,
            branch_template: "devpilot/issue-{issue_number}-{timestamp}".to_string(),
            commit_template: "Automated fix for: {issue_title}".to_string(),
            trigger_label: "ai-develop".to_string(),
            trigger_command: "/devpilot".to_string(),
            repository: RepositoryConfig::default(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Loads and validates [`Config`] from layered sources.
///
/// Precedence (lowest to highest): programmatic defaults, `devpilot.yaml`,
/// `devpilot.local.yaml`, `DEVPILOT_`-prefixed environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("devpilot.yaml"))
            .merge(Yaml::file("devpilot.local.yaml"))
            .merge(Env::prefixed("DEVPILOT_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Extraction(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .map_err(|e| ConfigError::Extraction(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.max_concurrent == 0 {
            return Err(ConfigError::InvalidMaxConcurrent(config.max_concurrent));
        }
        if config.agent_timeout_seconds == 0 {
            return Err(ConfigError::InvalidAgentTimeout(
                config.agent_timeout_seconds,
            ));
        }
        if config.agent_max_retries == 0 {
            return Err(ConfigError::InvalidAgentMaxRetries(
                config.agent_max_retries,
            ));
        }
        if config.agent_path.trim().is_empty() {
            return Err(ConfigError::EmptyAgentPath);
        }
        if !config.branch_template.contains("{issue_number}") {
            return Err(ConfigError::InvalidBranchTemplate(
                config.branch_template.clone(),
            ));
        }
        if config.trigger_label.trim().is_empty() {
            return Err(ConfigError::EmptyTriggerLabel);
        }
        if config.trigger_command.trim().is_empty() {
            return Err(ConfigError::EmptyTriggerCommand);
        }
        if config.repository.default_branch.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultBranch);
        }
        if config.database.path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        Ok(())
    }
}
