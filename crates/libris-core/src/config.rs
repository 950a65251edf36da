//! Application configuration management.
//!
//! This module handles loading and saving the configuration: backend base
//! URL, endpoint paths, request timeout, where the credential is kept and the
//! last used username.
//!
//! Configuration is stored at `~/.config/libris/config.json`. A few fields
//! can be overridden from the environment (`LIBRIS_*`).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::auth::{AuthEndpoints, CredentialMirror, FileMirror, KeyringMirror};
use crate::favorites::FavoritesEndpoints;

/// Application name used for config/data directory paths
const APP_NAME: &str = "libris";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured (local development server)
const DEFAULT_BASE_URL: &str = "http://localhost:8000";

const ENV_BASE_URL: &str = "LIBRIS_BASE_URL";
const ENV_CREDENTIAL_STORAGE: &str = "LIBRIS_CREDENTIAL_STORAGE";
const ENV_REQUEST_TIMEOUT: &str = "LIBRIS_REQUEST_TIMEOUT_SECS";

/// Where the credential is mirrored between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStorage {
    /// Not persisted; every run starts logged out
    Memory,
    #[default]
    File,
    Keyring,
}

impl FromStr for CredentialStorage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "none" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "keyring" | "keychain" => Ok(Self::Keyring),
            other => Err(anyhow::anyhow!("Unknown credential storage: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub auth: AuthEndpoints,
    pub favorites: FavoritesEndpoints,
    pub request_timeout_secs: u64,
    pub credential_storage: CredentialStorage,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth: AuthEndpoints::default(),
            favorites: FavoritesEndpoints::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            credential_storage: CredentialStorage::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `LIBRIS_*` overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(base_url) = get(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Some(storage) = get(ENV_CREDENTIAL_STORAGE) {
            self.credential_storage = storage.parse()?;
        }
        if let Some(timeout) = get(ENV_REQUEST_TIMEOUT) {
            self.request_timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_REQUEST_TIMEOUT))?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Durable mirror for the configured storage, `None` for memory-only.
    pub fn credential_mirror(&self) -> Result<Option<Arc<dyn CredentialMirror>>> {
        let mirror: Option<Arc<dyn CredentialMirror>> = match self.credential_storage {
            CredentialStorage::Memory => None,
            CredentialStorage::File => Some(Arc::new(FileMirror::new(Self::data_dir()?))),
            CredentialStorage::Keyring => Some(Arc::new(KeyringMirror::new())),
        };
        Ok(mirror)
    }
}
