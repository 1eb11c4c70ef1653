//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::locking::{ExpirationRounding, LockConfig, LockTimeout};
use crate::error::Error;
use crate::storage::default_database_path;

/// Davlock configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Timeout granted when a request does not name one
    pub default_timeout_secs: u64,
    /// Upper bound on granted timeouts, 0 for none
    pub max_timeout_secs: u64,
    /// Cleanup timer rounding: second, 100ms or exact
    pub rounding: String,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            max_timeout_secs: 0,
            rounding: ExpirationRounding::default().as_str().to_string(),
        }
    }
}

/// Lock store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
    Json,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Json => "json",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "json" => Ok(Self::Json),
            other => Err(Error::ConfigError(format!(
                "unknown storage backend '{}' (expected memory, sqlite or json)",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database or document path; the platform data dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Path the configured backend stores its locks at
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        match self.backend {
            StorageBackend::Json => default_database_path().with_file_name("locks.json"),
            StorageBackend::Memory | StorageBackend::Sqlite => default_database_path(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("DAVLOCK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("davlock")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the config dir, or defaults if there is no file
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the config dir
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.locks.default_timeout_secs == 0 {
            return Err(anyhow!("locks.default_timeout_secs must be greater than zero"));
        }
        self.locks
            .rounding
            .parse::<ExpirationRounding>()
            .map_err(|e| anyhow!("Invalid locks.rounding: {}", e))?;
        Ok(())
    }

    /// Manager settings described by this configuration
    pub fn lock_config(&self) -> anyhow::Result<LockConfig> {
        let rounding: ExpirationRounding = self
            .locks
            .rounding
            .parse()
            .map_err(|e| anyhow!("Invalid locks.rounding: {}", e))?;

        let mut config = LockConfig::default()
            .with_default_timeout(LockTimeout::seconds(self.locks.default_timeout_secs))
            .with_rounding(rounding);
        if self.locks.max_timeout_secs > 0 {
            config = config.with_max_timeout(Duration::from_secs(self.locks.max_timeout_secs));
        }
        Ok(config)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "locks.default_timeout_secs" => Ok(self.locks.default_timeout_secs.to_string()),
            "locks.max_timeout_secs" => Ok(self.locks.max_timeout_secs.to_string()),
            "locks.rounding" => Ok(self.locks.rounding.clone()),

            "storage.backend" => Ok(self.storage.backend.to_string()),
            "storage.path" => Ok(self.storage.resolved_path().display().to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `davlock config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "locks.default_timeout_secs" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid default_timeout_secs value: {}", value))?;
                if secs == 0 {
                    return Err(anyhow!("Default timeout must be greater than zero"));
                }
                self.locks.default_timeout_secs = secs;
            }
            "locks.max_timeout_secs" => {
                self.locks.max_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid max_timeout_secs value: {}", value))?;
            }
            "locks.rounding" => {
                let rounding: ExpirationRounding = value
                    .parse()
                    .map_err(|e| anyhow!("Invalid rounding: {}", e))?;
                self.locks.rounding = rounding.as_str().to_string();
            }

            "storage.backend" => {
                self.storage.backend = value.parse().map_err(|e| anyhow!("{}", e))?;
            }
            "storage.path" => {
                self.storage.path = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `davlock config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "locks.default_timeout_secs",
            "locks.max_timeout_secs",
            "locks.rounding",
            "storage.backend",
            "storage.path",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults by removing the config file
    pub fn reset() -> anyhow::Result<()> {
        Self::reset_at(&Self::config_path()?)
    }

    /// Remove the config file at `path` if present
    pub fn reset_at(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
