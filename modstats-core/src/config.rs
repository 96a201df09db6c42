//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/modstats/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/modstats/` (~/.config/modstats/)
//! - Data: `$XDG_DATA_HOME/modstats/` (~/.local/share/modstats/)
//! - State/Logs: `$XDG_STATE_HOME/modstats/` (~/.local/state/modstats/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Default collection endpoint for report submission.
pub const DEFAULT_ENDPOINT: &str = "https://stats.modstats.dev/submit";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Report submission configuration
    #[serde(default)]
    pub report: ReportConfig,

    /// Device identity overrides
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Report submission configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    /// Collection endpoint URL (defaults to the fixed submit endpoint)
    pub endpoint: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_report_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_report_timeout(),
        }
    }
}

impl ReportConfig {
    /// Returns the effective collection endpoint.
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "report.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            if endpoint.trim().is_empty() {
                return Err(Error::Config(
                    "report.endpoint must not be empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_report_timeout() -> u64 {
    30
}

/// Device identity overrides
///
/// Each field, when unset, falls back to the matching `MODSTATS_*`
/// environment variable and then to an empty string. Identifier sources
/// are treated as always-available; an empty value is accepted.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct IdentityConfig {
    /// Device model name (env fallback: MODSTATS_DEVICE)
    pub device_name: Option<String>,
    /// OS build version (env fallback: MODSTATS_VERSION)
    pub mod_version: Option<String>,
    /// ISO country code (env fallback: MODSTATS_COUNTRY)
    pub country_code: Option<String>,
    /// Mobile carrier name (env fallback: MODSTATS_CARRIER)
    pub carrier_name: Option<String>,
    /// Mobile carrier numeric id (env fallback: MODSTATS_CARRIER_ID)
    pub carrier_id: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.report.validate()?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/modstats/config.toml` (~/.config/modstats/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("modstats").join("config.toml")
    }

    /// Returns the data directory path (for the preference store)
    ///
    /// `$XDG_DATA_HOME/modstats/` (~/.local/share/modstats/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("modstats")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/modstats/` (~/.local/state/modstats/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("modstats")
    }

    /// Returns the preference store path
    ///
    /// `$XDG_DATA_HOME/modstats/prefs.db` (~/.local/share/modstats/prefs.db)
    pub fn prefs_path() -> PathBuf {
        Self::data_dir().join("prefs.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/modstats/modstats.log` (~/.local/state/modstats/modstats.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("modstats.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.report.endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.report.timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
        assert!(config.identity.device_name.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[report]
endpoint = "https://stats.example.org/submit"
timeout_secs = 10

[identity]
device_name = "starlite"
mod_version = "21.0-nightly"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.report.endpoint(), "https://stats.example.org/submit");
        assert_eq!(config.report.timeout_secs, 10);
        assert_eq!(config.identity.device_name.as_deref(), Some("starlite"));
        assert_eq!(config.identity.mod_version.as_deref(), Some("21.0-nightly"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_report_config_validation() {
        let config = ReportConfig::default();
        assert!(config.validate().is_ok());

        let config = ReportConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ReportConfig {
            endpoint: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
