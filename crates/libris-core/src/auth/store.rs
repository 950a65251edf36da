use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::{debug, warn};

use super::Credential;

/// Namespaced key the credential is mirrored under
pub const CREDENTIAL_KEY: &str = "libris_credential_v1";

/// Keychain service name
const SERVICE_NAME: &str = "libris";

// ============================================================================
// Durable mirrors
// ============================================================================

/// Durable copy of the current credential. The in-memory value in
/// [`CredentialStore`] stays authoritative.
pub trait CredentialMirror: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file in the data directory.
#[derive(Debug, Clone)]
pub struct FileMirror {
    path: PathBuf,
}

impl FileMirror {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(format!("{}.json", CREDENTIAL_KEY)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialMirror for FileMirror {
    fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credential file")?;
        let credential: Credential = serde_json::from_str(&contents)
            .context("Failed to parse credential file")?;
        Ok(Some(credential))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credential)?;
        std::fs::write(&self.path, contents).context("Failed to write credential file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("Failed to remove credential file"),
        }
    }
}

/// OS keychain entry holding the JSON-serialized credential.
#[derive(Debug, Clone)]
pub struct KeyringMirror {
    account: String,
}

impl KeyringMirror {
    pub fn new() -> Self {
        Self {
            account: CREDENTIAL_KEY.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).context("Failed to create keyring entry")
    }
}

impl Default for KeyringMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialMirror for KeyringMirror {
    fn load(&self) -> Result<Option<Credential>> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(Some(
                serde_json::from_str(&secret).context("Failed to parse keychain credential")?,
            )),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err).context("Failed to retrieve credential from keychain"),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let secret = serde_json::to_string(credential)?;
        self.entry()?
            .set_password(&secret)
            .context("Failed to store credential in keychain")
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err).context("Failed to delete credential from keychain"),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Holds the single current credential.
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
    mirror: Option<Arc<dyn CredentialMirror>>,
}

impl CredentialStore {
    /// Memory-only store
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            mirror: None,
        }
    }

    pub fn with_mirror(mirror: Arc<dyn CredentialMirror>) -> Self {
        Self {
            current: RwLock::new(None),
            mirror: Some(mirror),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Credential>> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Credential>> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Option<Credential> {
        self.read().clone()
    }

    /// Non-empty access token, if any
    pub fn access_token(&self) -> Option<String> {
        self.read()
            .as_ref()
            .filter(|c| !c.is_empty())
            .map(|c| c.access.clone())
    }

    pub fn is_present(&self) -> bool {
        self.read().is_some()
    }

    pub fn set(&self, credential: Credential) {
        if let Some(ref mirror) = self.mirror {
            if let Err(e) = mirror.save(&credential) {
                warn!(error = %e, "Failed to mirror credential to durable storage");
            }
        }
        *self.write() = Some(credential);
    }

    /// Drop the credential and return what was held.
    pub fn clear(&self) -> Option<Credential> {
        let previous = self.write().take();
        if let Some(ref mirror) = self.mirror {
            if let Err(e) = mirror.clear() {
                warn!(error = %e, "Failed to clear mirrored credential");
            }
        }
        previous
    }

    /// Load the mirrored credential into memory. Returns true if one was found.
    pub fn restore(&self) -> bool {
        let Some(ref mirror) = self.mirror else {
            return false;
        };
        match mirror.load() {
            Ok(Some(credential)) if !credential.is_empty() => {
                debug!("Restored credential from durable storage");
                *self.write() = Some(credential);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "Failed to load mirrored credential");
                false
            }
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
