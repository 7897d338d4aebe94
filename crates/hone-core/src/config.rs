//! Configuration parsing for the engine.
//!
//! Key=value format with `#` comments and optional quotes. Adapter settings use
//! dotted keys: `adapter.<name>.<field>=value`.
//! Precedence: CLI flags > `--config` file > defaults.

use crate::controller::DEFAULT_MAX_ITERATIONS;
use crate::types::{RunRequest, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Name of the built-in in-process adapter.
pub const STRUCTURE_ADAPTER: &str = "structure";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid severity for {key}: {value}")]
    InvalidSeverity { key: String, value: String },
    #[error("adapter {0} has no cmd configured")]
    MissingAdapterCommand(String),
    #[error("adapter {0} is listed twice")]
    DuplicateAdapter(String),
    #[error("{key} must be greater than zero")]
    MustBePositive { key: &'static str },
}

/// What the admission gate does when every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Wait for a slot.
    #[default]
    Queue,
    /// Fail the run immediately.
    Reject,
}

impl AdmissionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Reject => "reject",
        }
    }
}

/// How an adapter's process output becomes findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Exit 0 is clean; anything else is one finding built from the output tail.
    #[default]
    ExitCode,
    /// Stdout is a JSON array of normalized findings.
    FindingsJson,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExitCode => "exit_code",
            Self::FindingsJson => "findings_json",
        }
    }
}

/// Settings for one validation adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub name: String,
    /// Shell command. `{dir}`, `{file}` and `{rule_set}` are substituted.
    pub cmd: Option<String>,
    pub format: OutputFormat,
    pub required: bool,
    pub timeout_sec: u64,
    /// When non-empty, only findings with these severities are kept.
    pub severity_filter: Vec<Severity>,
    pub rule_set: Option<String>,
    /// Severity of the finding emitted for a non-zero exit in `exit_code` format.
    pub failure_severity: Severity,
}

impl AdapterConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: None,
            format: OutputFormat::ExitCode,
            required: true,
            timeout_sec: 120,
            severity_filter: Vec::new(),
            rule_set: None,
            failure_severity: Severity::High,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Run defaults (a start request may override these)
    pub max_iterations: u32,
    pub total_timeout_sec: u64,
    pub blocking_severity: Severity,

    // Admission
    pub max_concurrent_workflows: usize,
    pub admission_policy: AdmissionPolicy,

    // Suspension point bounds
    pub join_grace_ms: u64,
    pub generator_timeout_sec: u64,
    pub checkpoint_timeout_sec: u64,

    // Checkpoint store
    pub checkpoint_ttl_sec: u64,
    /// Database file; the binary picks a per-user default when unset.
    pub db_path: Option<PathBuf>,

    // Collaborators
    pub generator_cmd: Option<String>,

    // Adapters, in registration order
    pub adapters: Vec<String>,
    pub adapter_settings: BTreeMap<String, AdapterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            total_timeout_sec: 3600,
            blocking_severity: Severity::High,
            max_concurrent_workflows: 5,
            admission_policy: AdmissionPolicy::Queue,
            join_grace_ms: 2000,
            generator_timeout_sec: 300,
            checkpoint_timeout_sec: 10,
            checkpoint_ttl_sec: 7 * 24 * 3600,
            db_path: None,
            generator_cmd: None,
            adapters: vec![STRUCTURE_ADAPTER.to_string()],
            adapter_settings: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            if let Some(rest) = key.strip_prefix("adapter.") {
                self.apply_adapter_value(key, rest, &value)?;
            } else {
                self.apply_value(key, &value)?;
            }
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_iterations" => self.max_iterations = Self::parse_int(key, value)?,
            "total_timeout_sec" => self.total_timeout_sec = Self::parse_int(key, value)?,
            "blocking_severity" => self.blocking_severity = Self::parse_severity(key, value)?,
            "max_concurrent_workflows" => {
                self.max_concurrent_workflows = Self::parse_int(key, value)?;
            }
            "admission_policy" => {
                self.admission_policy = match value {
                    "queue" => AdmissionPolicy::Queue,
                    "reject" => AdmissionPolicy::Reject,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "admission_policy must be 'queue' or 'reject', got '{value}'"
                        )))
                    }
                }
            }
            "join_grace_ms" => self.join_grace_ms = Self::parse_int(key, value)?,
            "generator_timeout_sec" => self.generator_timeout_sec = Self::parse_int(key, value)?,
            "checkpoint_timeout_sec" => {
                self.checkpoint_timeout_sec = Self::parse_int(key, value)?;
            }
            "checkpoint_ttl_sec" => self.checkpoint_ttl_sec = Self::parse_int(key, value)?,
            "db_path" => self.db_path = (!value.is_empty()).then(|| PathBuf::from(value)),
            "generator_cmd" => {
                self.generator_cmd = (!value.is_empty()).then(|| value.to_string());
            }
            "adapters" => {
                self.adapters = Self::split_list(value).map(str::to_string).collect();
            }
            _ => {
                warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    /// Apply `adapter.<name>.<field>`; `rest` is the key without the prefix.
    fn apply_adapter_value(&mut self, key: &str, rest: &str, value: &str) -> Result<(), ConfigError> {
        let Some((name, field)) = rest.rsplit_once('.') else {
            return Err(ConfigError::InvalidLine(format!(
                "adapter keys look like adapter.<name>.<field>, got '{key}'"
            )));
        };
        let adapter = self
            .adapter_settings
            .entry(name.to_string())
            .or_insert_with(|| AdapterConfig::named(name));

        match field {
            "cmd" => adapter.cmd = (!value.is_empty()).then(|| value.to_string()),
            "format" => {
                adapter.format = match value {
                    "exit_code" => OutputFormat::ExitCode,
                    "findings_json" => OutputFormat::FindingsJson,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "{key} must be 'exit_code' or 'findings_json', got '{value}'"
                        )))
                    }
                }
            }
            "required" => adapter.required = Self::parse_bool(key, value)?,
            "timeout_sec" => adapter.timeout_sec = Self::parse_int(key, value)?,
            "severity_filter" => {
                adapter.severity_filter = Self::split_list(value)
                    .map(|s| Self::parse_severity(key, s))
                    .collect::<Result<_, _>>()?;
            }
            "rule_set" => adapter.rule_set = (!value.is_empty()).then(|| value.to_string()),
            "failure_severity" => adapter.failure_severity = Self::parse_severity(key, value)?,
            _ => {
                warn!(key, "unknown adapter config key");
            }
        }
        Ok(())
    }

    fn split_list(value: &str) -> impl Iterator<Item = &str> {
        value
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_severity(key: &str, value: &str) -> Result<Severity, ConfigError> {
        Severity::parse(value).ok_or_else(|| ConfigError::InvalidSeverity {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Check cross-field constraints that single-key parsing cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_workflows == 0 {
            return Err(ConfigError::MustBePositive {
                key: "max_concurrent_workflows",
            });
        }
        if self.total_timeout_sec == 0 {
            return Err(ConfigError::MustBePositive {
                key: "total_timeout_sec",
            });
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.adapters {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateAdapter(name.clone()));
            }
            if name == STRUCTURE_ADAPTER {
                continue;
            }
            let has_cmd = self
                .adapter_settings
                .get(name)
                .is_some_and(|a| a.cmd.is_some());
            if !has_cmd {
                return Err(ConfigError::MissingAdapterCommand(name.clone()));
            }
        }
        Ok(())
    }

    /// A start request carrying this config's run defaults.
    pub fn run_request(&self, requirements: impl Into<String>) -> RunRequest {
        RunRequest {
            requirements: requirements.into(),
            max_iterations: self.max_iterations,
            total_timeout_sec: self.total_timeout_sec,
            blocking_severity: self.blocking_severity,
            initial_candidate: None,
        }
    }

    /// Settings for every listed adapter, in registration order.
    pub fn adapter_configs(&self) -> Vec<AdapterConfig> {
        self.adapters
            .iter()
            .map(|name| {
                self.adapter_settings
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| AdapterConfig::named(name.clone()))
            })
            .collect()
    }
}
