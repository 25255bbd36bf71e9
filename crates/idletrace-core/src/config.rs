//! Configuration for idletrace
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Conversion into [`IdleTransactionOptions`]

use crate::idle::IdleTransactionOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "IDLETRACE_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdletraceConfig {
    pub tracer: TracerSettings,

    pub idle: IdleSettings,

    pub report: ReportSettings,
}

/// General settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for TracerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Idle transaction defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSettings {
    /// Wait after the last child finishes
    pub idle_timeout_ms: u64,

    /// Publish idle transactions on the hub scope
    pub on_scope: bool,

    /// Span cap per transaction, root included (unset = unbounded)
    pub max_spans: Option<usize>,
}

impl Default for IdleSettings {
    fn default() -> Self {
        let options = IdleTransactionOptions::default();
        Self {
            idle_timeout_ms: options.idle_timeout.as_millis() as u64,
            on_scope: options.on_scope,
            max_spans: options.max_spans,
        }
    }
}

impl IdleSettings {
    pub fn to_options(&self) -> IdleTransactionOptions {
        IdleTransactionOptions {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            on_scope: self.on_scope,
            max_spans: self.max_spans,
        }
    }
}

/// Where finished transactions go
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Append finished transactions to this JSONL file
    pub jsonl_path: Option<String>,
}

/// Configuration loader
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. IDLETRACE_CONFIG environment variable
    /// 3. ~/.config/idletrace/config.toml
    /// 4. /etc/idletrace/config.toml
    /// 5. Default values
    ///
    /// Environment overrides are applied on top.
    pub fn load(&self) -> ConfigResult<IdletraceConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                IdletraceConfig::default()
            }
        };

        apply_overrides(&mut config, |key| std::env::var(key).ok());
        validate(&config)?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("{} path does not exist: {}", CONFIG_ENV, env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/idletrace/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Parse a TOML config file
    pub fn load_from_file(path: &Path) -> ConfigResult<IdletraceConfig> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a file
    pub fn save(config: &IdletraceConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("idletrace").join("config.toml"))
    }
}

/// Apply `IDLETRACE_*` overrides looked up through `lookup`
///
/// Values that fail to parse are ignored with a warning.
pub fn apply_overrides(config: &mut IdletraceConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("IDLETRACE_LOG_LEVEL") {
        config.tracer.log_level = val;
    }

    if let Some(val) = lookup("IDLETRACE_IDLE_TIMEOUT_MS") {
        match val.parse() {
            Ok(ms) => config.idle.idle_timeout_ms = ms,
            Err(_) => warn!("Ignoring invalid IDLETRACE_IDLE_TIMEOUT_MS: {}", val),
        }
    }
    if let Some(val) = lookup("IDLETRACE_ON_SCOPE") {
        config.idle.on_scope = val.parse().unwrap_or(config.idle.on_scope);
    }
    if let Some(val) = lookup("IDLETRACE_MAX_SPANS") {
        match val.parse() {
            Ok(max) => config.idle.max_spans = Some(max),
            Err(_) => warn!("Ignoring invalid IDLETRACE_MAX_SPANS: {}", val),
        }
    }

    if let Some(val) = lookup("IDLETRACE_JSONL_PATH") {
        config.report.jsonl_path = Some(val);
    }
}

/// Validate configuration
pub fn validate(config: &IdletraceConfig) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.tracer.log_level.to_lowercase().as_str()) {
        return Err(ConfigError::ValidationError(format!(
            "Invalid log level: {}. Must be one of: {:?}",
            config.tracer.log_level, valid_levels
        )));
    }

    if config.idle.max_spans == Some(0) {
        return Err(ConfigError::ValidationError(
            "max_spans cannot be 0; leave it unset for no limit".to_string(),
        ));
    }

    Ok(())
}
