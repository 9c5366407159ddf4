//! Credential persistence.
//!
//! Each backend's credential is one JSON document. The OS keyring is the
//! primary home; when the keyring is unavailable the document is written to
//! an owner-only file in the config directory instead.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::backends::BackendId;
use crate::config::{ConfigError, StorageBackend, StorageConfig};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Seconds since the Unix epoch
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Everything needed to make authenticated calls to one backend
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub backend: BackendId,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp; `None` means the backend does not expire credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
}

impl Credential {
    pub fn new(backend: BackendId, access_token: impl Into<String>) -> Self {
        Self {
            backend,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            instance_url: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_instance_url(mut self, instance_url: impl Into<String>) -> Self {
        self.instance_url = Some(instance_url.into());
        self
    }

    /// Expired, or expiring within `buffer`. Credentials without an expiry
    /// never report expired.
    pub fn is_expired(&self, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= unix_now() + buffer.as_secs(),
            None => false,
        }
    }

    pub fn seconds_remaining(&self) -> Option<u64> {
        self.expires_at.map(|t| t.saturating_sub(unix_now()))
    }

    /// Short stable identifier for logs; never reveals the token
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.access_token.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("backend", &self.backend)
            .field("access_token", &format_args!("[{}]", self.fingerprint()))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("expires_at", &self.expires_at)
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

/// A place credentials can be kept
pub trait SecretStore: Send + Sync {
    /// Short name used in logs (e.g. "keyring")
    fn name(&self) -> &'static str;

    /// `Ok(None)` when nothing is stored for the backend
    fn load(&self, backend: BackendId) -> Result<Option<Credential>, StoreError>;

    /// Replace the stored credential in a single write
    fn save(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Idempotent: succeeds when nothing is stored
    fn delete(&self, backend: BackendId) -> Result<(), StoreError>;
}

/// OS keyring (Keychain, Credential Manager, kernel keyutils)
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, backend: BackendId) -> Result<keyring::Entry, StoreError> {
        Ok(keyring::Entry::new(&self.service, backend.as_str())?)
    }
}

impl SecretStore for KeyringStore {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn load(&self, backend: BackendId) -> Result<Option<Credential>, StoreError> {
        match self.entry(backend)?.get_password() {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let json = serde_json::to_string(credential)?;
        self.entry(credential.backend)?.set_password(&json)?;
        Ok(())
    }

    fn delete(&self, backend: BackendId) -> Result<(), StoreError> {
        match self.entry(backend)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One JSON file per backend, readable only by the owner
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, backend: BackendId) -> PathBuf {
        self.dir.join(format!("{}.json", backend))
    }
}

impl SecretStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self, backend: BackendId) -> Result<Option<Credential>, StoreError> {
        let path = self.path(backend);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        create_private_dir(&self.dir)?;
        let json = serde_json::to_vec_pretty(credential)?;
        write_private(&self.path(credential.backend), &json)?;
        Ok(())
    }

    fn delete(&self, backend: BackendId) -> Result<(), StoreError> {
        let path = self.path(backend);
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::debug!("Deleted {:?}", path);
        }
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write to a sibling temp file with mode 0600, then rename over the target
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)
}

/// Process-local store; nothing survives a restart
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<BackendId, Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self, backend: BackendId) -> Result<Option<Credential>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&backend).cloned())
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(credential.backend, credential.clone());
        Ok(())
    }

    fn delete(&self, backend: BackendId) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&backend);
        Ok(())
    }
}

/// Primary store with an optional fallback used when the primary errors
pub struct CredentialStore {
    primary: Box<dyn SecretStore>,
    fallback: Option<Box<dyn SecretStore>>,
}

impl CredentialStore {
    pub fn new(primary: impl SecretStore + 'static) -> Self {
        Self {
            primary: Box::new(primary),
            fallback: None,
        }
    }

    pub fn with_fallback(
        primary: impl SecretStore + 'static,
        fallback: impl SecretStore + 'static,
    ) -> Self {
        Self {
            primary: Box::new(primary),
            fallback: Some(Box::new(fallback)),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, ConfigError> {
        let store = match config.backend {
            StorageBackend::Keyring => Self::with_fallback(
                KeyringStore::new(&config.keyring_service),
                FileStore::new(crate::config::get_credentials_dir()?),
            ),
            StorageBackend::File => Self::new(FileStore::new(crate::config::get_credentials_dir()?)),
            StorageBackend::Memory => Self::new(MemoryStore::new()),
        };
        Ok(store)
    }

    pub fn load(&self, backend: BackendId) -> Result<Option<Credential>, StoreError> {
        match self.primary.load(backend) {
            Ok(Some(credential)) => return Ok(Some(credential)),
            Ok(None) => {}
            Err(e) => match &self.fallback {
                Some(fallback) => tracing::warn!(
                    "{} unavailable for {} ({}), trying {}",
                    self.primary.name(),
                    backend,
                    e,
                    fallback.name()
                ),
                None => return Err(e),
            },
        }

        match &self.fallback {
            Some(fallback) => fallback.load(backend),
            None => Ok(None),
        }
    }

    pub fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        match self.primary.save(credential) {
            Ok(()) => {
                // a stale fallback copy would outlive a later keyring delete
                if let Some(fallback) = &self.fallback {
                    if let Err(e) = fallback.delete(credential.backend) {
                        tracing::debug!("Could not clear {} copy: {}", fallback.name(), e);
                    }
                }
                tracing::debug!(
                    "Stored {} credential {} in {}",
                    credential.backend,
                    credential.fingerprint(),
                    self.primary.name()
                );
                Ok(())
            }
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(
                        "{} save failed for {} ({}), using {}",
                        self.primary.name(),
                        credential.backend,
                        e,
                        fallback.name()
                    );
                    fallback.save(credential)
                }
                None => Err(e),
            },
        }
    }

    pub fn delete(&self, backend: BackendId) -> Result<(), StoreError> {
        let primary = self.primary.delete(backend);
        let fallback = match &self.fallback {
            Some(fallback) => fallback.delete(backend),
            None => Ok(()),
        };
        primary.and(fallback)
    }
}
