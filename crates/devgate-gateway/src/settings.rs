/*!
 * Gateway settings.
 *
 * Settings are layered: built-in defaults, then an optional settings file,
 * then environment variables (`DEVGATE__AGENT__CONFIG_DIR=...`).
 */
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Environment variable prefix of the gateway settings
pub const ENV_PREFIX: &str = "devgate";

/// Gateway settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Driver agent configuration
    #[serde(default)]
    pub agent: AgentSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log filter directive, `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json: bool,
}

/// Driver agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Directory holding config.yaml, drivers.yaml and devices.yaml
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("./config")
}

/// A builder for loading [`Settings`]
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings_file: Option<PathBuf>,
    environment_prefix: Option<String>,
}

impl SettingsBuilder {
    /// Create a new SettingsBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the settings file path
    pub fn with_settings_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.settings_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Load the settings
    pub fn build(self) -> Result<Settings> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = self.settings_file {
            if path.exists() {
                debug!("Loading settings from {}", path.display());
                builder = builder.add_source(File::from(path));
            } else {
                debug!("Settings file {} does not exist, using defaults", path.display());
            }
        }

        if let Some(prefix) = self.environment_prefix {
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        Ok(builder.build()?.try_deserialize()?)
    }
}
