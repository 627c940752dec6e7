use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{write_private_file, ConfigLocator};

use super::{Credential, SessionError};

/// Holder of the session's single live credential.
///
/// `set` replaces the whole credential, `clear` removes it. Implementations must be cheap and
/// non-blocking because the dispatcher reads on every request.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<Credential>, SessionError>;
    fn set(&self, credential: &Credential) -> Result<(), SessionError>;
    fn clear(&self) -> Result<(), SessionError>;
}

/// Credential kept for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            inner: RwLock::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<Credential>, SessionError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.clone())
    }

    fn set(&self, credential: &Credential) -> Result<(), SessionError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
        Ok(())
    }
}

/// Filesystem-backed credential storage located in the user configuration directory.
///
/// The credential survives restarts until it is cleared by logout or a failed refresh. Reads are
/// served from memory; writers serialize on a separate lock so disk I/O never holds up `get`.
pub struct FileCredentialStore {
    locator: ConfigLocator,
    profile: String,
    cache: RwLock<Option<Credential>>,
    write: Mutex<()>,
}

impl FileCredentialStore {
    /// Open the store for `profile`. An unreadable credential file is treated as absent and
    /// removed by the next `set` or `clear`.
    pub fn new(locator: ConfigLocator, profile: impl Into<String>) -> Result<Self, SessionError> {
        let profile = profile.into();
        let cached = Self::read_file(&locator.credentials_file(&profile))?;
        Ok(Self {
            locator,
            profile,
            cache: RwLock::new(cached),
            write: Mutex::new(()),
        })
    }

    pub fn with_default_locator(profile: impl Into<String>) -> Result<Self, SessionError> {
        Self::new(ConfigLocator::new()?, profile)
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    fn read_file(path: &Path) -> Result<Option<Credential>, SessionError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<CredentialEnvelope>(&raw) {
            Ok(envelope) => Ok(Some(envelope.credential)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable credential file");
                Ok(None)
            }
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Result<Option<Credential>, SessionError> {
        let guard = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.clone())
    }

    fn set(&self, credential: &Credential) -> Result<(), SessionError> {
        let envelope = CredentialEnvelope {
            version: 1,
            profile: self.profile.clone(),
            credential: credential.clone(),
        };
        let payload = serde_json::to_string_pretty(&envelope)?;

        let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        write_private_file(&self.locator.credentials_file(&self.profile), &payload)?;
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
        match fs::remove_file(self.locator.credentials_file(&self.profile)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialEnvelope {
    version: u32,
    profile: String,
    credential: Credential,
}
