//! Configuration management for fleetlog.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "fleetlog";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "fleetlog.db";

/// Default directory name of the file-backed remote store.
const REMOTE_DIR_NAME: &str = "remote";

/// Prefix of configuration environment variables.
const ENV_PREFIX: &str = "FLEETLOG_";

/// User recorded as trip owner when none is configured.
pub const DEFAULT_USER_ID: &str = "local";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FLEETLOG_`, sections separated
///    by `__`, e.g. `FLEETLOG_CAPTURE__CADENCE_MS`)
/// 2. TOML config file at `~/.config/fleetlog/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Capture configuration.
    pub capture: CaptureConfig,
    /// Sync configuration.
    pub sync: SyncConfig,
    /// Identity configuration.
    pub identity: IdentityConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/fleetlog/fleetlog.db`
    pub database_path: Option<PathBuf>,
}

/// Capture-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interval between location samples in milliseconds.
    pub cadence_ms: u64,
    /// Capacity of the location feed channel.
    pub channel_capacity: usize,
    /// JSON route replayed as the location source.
    pub replay_path: Option<PathBuf>,
    /// Restart the route from the beginning when it ends.
    pub replay_loop: bool,
}

/// Sync-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory the file-backed remote store writes trips to.
    /// Defaults to `~/.local/share/fleetlog/remote`
    pub remote_dir: Option<PathBuf>,
}

/// Identity configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// User that owns the trips recorded on this device.
    pub user_id: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 5_000,
            channel_capacity: 64,
            replay_path: None,
            replay_loop: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a single TOML file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed or invalid.
    pub fn check_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigValidation {
                message: format!("config file not found: {}", path.display()),
            });
        }
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.capture.cadence_ms == 0 {
            return Err(Error::ConfigValidation {
                message: "cadence_ms must be greater than 0".to_string(),
            });
        }

        if self.capture.channel_capacity == 0 {
            return Err(Error::ConfigValidation {
                message: "channel_capacity must be greater than 0".to_string(),
            });
        }

        if let Some(user) = &self.identity.user_id {
            if user.trim().is_empty() {
                return Err(Error::ConfigValidation {
                    message: "user_id must not be blank".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the remote store directory, resolving defaults if not set.
    #[must_use]
    pub fn remote_dir(&self) -> PathBuf {
        self.sync
            .remote_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(REMOTE_DIR_NAME))
    }

    /// Get the configured user, or the default one.
    #[must_use]
    pub fn user_id(&self) -> &str {
        self.identity.user_id.as_deref().unwrap_or(DEFAULT_USER_ID)
    }

    /// Get the sampling cadence as a Duration.
    #[must_use]
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.capture.cadence_ms)
    }
    /// Get the replay route that feeds capture.
    ///
    /// # Errors
    ///
    /// Returns a validation error if no route is configured, since capture
    /// would otherwise arm with nothing feeding it.
    pub fn replay_route(&self) -> Result<&Path> {
        self.capture.replay_path.as_deref().ok_or_else(|| Error::ConfigValidation {
            message: "no location source configured: set [capture] replay_path \
                      (or FLEETLOG_CAPTURE__REPLAY_PATH) to a route file"
                .to_string(),
        })
    }
}
