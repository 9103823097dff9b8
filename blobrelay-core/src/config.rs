use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::RegistryConfig;
use crate::transfer::TransferConfig;

/// Environment variable naming an alternate config file
pub const CONFIG_ENV: &str = "BLOBRELAY_CONFIG";

/// Default environment variable holding a store password
pub const DEFAULT_PASSWORD_ENV: &str = "BLOBRELAY_PG_PASSWORD";

/// Centralized configuration for blobrelay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSection,
    pub transfer: TransferSection,
    pub registry: RegistrySection,
    pub files: FilesSection,

    /// Named PostgreSQL stores (keyed by the name used in routes)
    pub stores: BTreeMap<String, StoreSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub cors_permissive: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:1880".to_string(),
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub chunk_size: usize,
    pub channel_depth: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        let defaults = TransferConfig::default();
        Self {
            chunk_size: defaults.chunk_size,
            channel_depth: defaults.channel_depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// 0 disables expiry
    pub ttl_secs: u64,
    pub capacity: usize,
    pub sweep_interval_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 64,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesSection {
    /// Where `/file-upload` and `target=file` handoffs write
    pub upload_dir: PathBuf,
    /// Where `/file-download` reads from
    pub download_dir: PathBuf,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./data/upload-stream"),
            download_dir: PathBuf::from("./data/files"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Name of the environment variable holding the password
    pub password_env: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "filesdb".to_string(),
            user: "blobrelay".to_string(),
            password_env: DEFAULT_PASSWORD_ENV.to_string(),
            max_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

/// Which pool a store uses. Two stores with the same identity share a pool.
///
/// Holds the *name* of the password variable, never the password.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigIdentity {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password_env: String,
}

impl std::fmt::Display for ConfigIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

impl StoreSection {
    pub fn identity(&self) -> ConfigIdentity {
        ConfigIdentity {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password_env: self.password_env.clone(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl RelayConfig {
    /// Load config from an explicit path, `$BLOBRELAY_CONFIG`, or
    /// `~/.blobrelay/config.toml`, in that order.
    ///
    /// An explicit path must exist; the other locations fall back to
    /// defaults when absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match env::var_os(CONFIG_ENV) {
                Some(path) => (PathBuf::from(path), true),
                None => (Self::config_path(), false),
            },
        };

        if !path.exists() {
            if required {
                anyhow::bail!(
                    "Config not found at {:?}\n\nRun: blobrelay config init",
                    path
                );
            }
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Parse and validate one file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .context("Failed to parse config file (invalid TOML)")?;
        config.validate()?;
        Ok(config)
    }

    /// Get default config file path: ~/.blobrelay/config.toml
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".blobrelay/config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.transfer.chunk_size == 0 {
            errors.push("  ✗ transfer.chunk_size must be > 0".to_string());
        }
        if self.transfer.channel_depth == 0 {
            errors.push("  ✗ transfer.channel_depth must be > 0".to_string());
        }
        if self.registry.capacity == 0 {
            errors.push("  ✗ registry.capacity must be > 0".to_string());
        }
        for (name, store) in &self.stores {
            if store.max_connections == 0 {
                errors.push(format!("  ✗ stores.{name}.max_connections must be > 0"));
            }
            if store.password_env.is_empty() {
                errors.push(format!("  ✗ stores.{name}.password_env is empty"));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Config validation failed:\n{}", errors.join("\n"));
        }
        Ok(())
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            channel_depth: self.transfer.channel_depth,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            ttl: (self.registry.ttl_secs > 0).then(|| Duration::from_secs(self.registry.ttl_secs)),
            capacity: self.registry.capacity,
        }
    }

    /// Example file written by `blobrelay config init`
    pub fn template() -> Self {
        let mut config = Self::default();
        config.stores.insert("main".to_string(), StoreSection::default());
        config
    }

    /// Save config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_str = toml::to_string_pretty(self)
            .context("Failed to serialize config to TOML")?;

        fs::write(path, toml_str)
            .context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}
