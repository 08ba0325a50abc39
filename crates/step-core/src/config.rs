//! Configuration for the step execution daemon.
//!
//! Uses the `key=value` env-file format. Keys are accepted either bare
//! (`port=3000`) or in their environment form (`STEPD_PORT=3000`).
//! Precedence: CLI flags > environment > env file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "STEPD_";

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
}

/// Daemon configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Server
    pub bind_host: String,
    pub port: u16,
    pub auth_token: Option<String>,

    // Logging
    pub debug: bool,
    pub trace: bool,

    // Remote log service
    pub log_service_url: Option<String>,
    pub log_service_token: Option<String>,
    pub account_id: String,
    pub log_flush_interval_ms: u64,
    pub trim_newline_suffix: bool,

    /// Scratch directory for step output and artifact files.
    pub work_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 3000,
            auth_token: None,
            debug: false,
            trace: false,
            log_service_url: None,
            log_service_token: None,
            account_id: String::new(),
            log_flush_interval_ms: 1000,
            trim_newline_suffix: false,
            work_dir: dirs::data_local_dir()
                .map_or_else(|| std::env::temp_dir().join("stepd"), |d| d.join("stepd")),
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

    /// Overlay `STEPD_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_vars(std::env::vars())
    }

    /// Overlay `STEPD_*` variables from the given pairs. Other keys are ignored.
    pub fn apply_env_vars<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key.starts_with(ENV_PREFIX) {
                self.apply_value(&key, &value)?;
            }
        }
        Ok(())
    }

    /// Interval between remote log flushes.
    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms.max(1))
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            // `export KEY=value` is common in env files
            let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
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

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let normalized = key
            .strip_prefix(ENV_PREFIX)
            .unwrap_or(key)
            .to_ascii_lowercase();

        match normalized.as_str() {
            "bind_host" => self.bind_host = value.to_string(),
            "port" => self.port = Self::parse_int(key, value)?,
            "auth_token" => self.auth_token = Self::non_empty(value),
            "debug" => self.debug = Self::parse_bool(key, value)?,
            "trace" => self.trace = Self::parse_bool(key, value)?,
            "log_service_url" => self.log_service_url = Self::non_empty(value),
            "log_service_token" => self.log_service_token = Self::non_empty(value),
            "account_id" => self.account_id = value.to_string(),
            "log_flush_interval_ms" => self.log_flush_interval_ms = Self::parse_int(key, value)?,
            "trim_newline_suffix" => self.trim_newline_suffix = Self::parse_bool(key, value)?,
            "work_dir" => self.work_dir = PathBuf::from(value),
            _ => {
                // Env files are shared with other tools; only warn about our own keys.
                if key.starts_with(ENV_PREFIX) {
                    eprintln!("Warning: unknown config key: {key}");
                }
            }
        }
        Ok(())
    }

    fn non_empty(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
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
}
