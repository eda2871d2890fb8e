//! Application configuration management.
//!
//! Configuration is stored at `~/.config/teamsync/config.json` and falls
//! back to defaults when the file is absent. A few settings can be
//! overridden from the environment (see [`Config::apply_env`]).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Application name used for config/data directory paths
const APP_NAME: &str = "teamsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

pub const ENV_API_URL: &str = "TEAMSYNC_API_URL";
pub const ENV_VAULT_PASSPHRASE: &str = "TEAMSYNC_VAULT_PASSPHRASE";

/// Where credentials are kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialBackendKind {
    /// OS keychain
    #[default]
    Keyring,
    /// Passphrase-protected file in the data directory
    EncryptedFile,
    /// Process lifetime only
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Upper bound on how long boot may show a loading state.
    pub verification_timeout_secs: u64,
    pub default_stale_time_secs: u64,
    pub request_timeout_secs: u64,
    pub credential_backend: CredentialBackendKind,
    pub log_dir: Option<PathBuf>,
    /// Passphrase for the encrypted-file backend. Only read from the
    /// environment, never written to disk.
    #[serde(skip)]
    pub vault_passphrase: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            verification_timeout_secs: 5,
            default_stale_time_secs: 30,
            request_timeout_secs: 30,
            credential_backend: CredentialBackendKind::default(),
            log_dir: None,
            vault_passphrase: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(passphrase) = lookup(ENV_VAULT_PASSPHRASE).filter(|v| !v.is_empty()) {
            self.vault_passphrase = Some(passphrase);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the session snapshot and the credential vault.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn default_stale_time(&self) -> Duration {
        Duration::from_secs(self.default_stale_time_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
