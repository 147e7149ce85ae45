//! Session token providers.
//!
//! The core never stores credentials itself; it watches a provider and reacts
//! when the credential changes or disappears. [`TokenStore`] persists the
//! token as an opaque string across process restarts.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::debug;

use crate::types::Credential;

/// Errors from credential persistence.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Supplies the current credential and notifies on change or expiry.
///
/// `None` means no usable credential (logged out, expired, or revoked).
pub trait CredentialProvider: Send + Sync {
    fn watch(&self) -> watch::Receiver<Option<Credential>>;

    /// The credential right now.
    fn current(&self) -> Option<Credential> {
        self.watch().borrow().clone()
    }
}

/// In-memory provider for applications that manage tokens themselves.
#[derive(Debug)]
pub struct StaticCredentials {
    tx: watch::Sender<Option<Credential>>,
}

impl StaticCredentials {
    pub fn new(initial: Option<Credential>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publishes a new credential.
    pub fn set(&self, credential: Credential) {
        self.tx.send_replace(Some(credential));
    }

    /// Withdraws the credential.
    pub fn revoke(&self) {
        self.tx.send_replace(None);
    }
}

impl CredentialProvider for StaticCredentials {
    fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

/// File-backed credential store.
///
/// The credential is cached in memory and persisted to a JSON file on every
/// change.
pub struct TokenStore {
    path: PathBuf,
    tx: watch::Sender<Option<Credential>>,
}

impl TokenStore {
    /// Creates a store, loading an existing credential from disk.
    pub fn new(path: PathBuf) -> Result<Self, CredentialError> {
        let credential = load_credential(&path)?;
        let (tx, _) = watch::channel(credential);
        Ok(Self { path, tx })
    }

    /// Saves and publishes a credential.
    pub fn save(&self, credential: Credential) -> Result<(), CredentialError> {
        self.persist(Some(&credential))?;
        self.tx.send_replace(Some(credential));
        Ok(())
    }

    /// Removes the stored credential (logout) and publishes `None`.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.tx.send_replace(None);
        debug!(path = ?self.path, "credential cleared");
        Ok(())
    }

    /// Writes the credential to disk.
    fn persist(&self, credential: Option<&Credential>) -> Result<(), CredentialError> {
        let json = serde_json::to_string_pretty(&credential)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;

        // The file holds a bearer token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!(path = ?self.path, "persisted credential");
        Ok(())
    }
}

impl CredentialProvider for TokenStore {
    fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

/// Loads a credential from a JSON file on disk.
fn load_credential(path: &Path) -> Result<Option<Credential>, CredentialError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let credential: Option<Credential> = serde_json::from_str(&data)?;
    debug!(path = ?path, present = credential.is_some(), "loaded credential");
    Ok(credential)
}

/// Returns the default token store path.
pub fn default_token_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("fleetsync").join("token.json"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
