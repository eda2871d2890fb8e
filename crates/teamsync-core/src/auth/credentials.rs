//! Storage for the access/refresh credential pair.
//!
//! Secrets live behind a [`CredentialBackend`] (OS keychain, encrypted file,
//! or memory). Each secret carries its own expiry; an expired secret reads
//! as absent and is deleted on the way out.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::utils::redact;

const SERVICE_NAME: &str = "teamsync";

pub const ACCESS_TOKEN: &str = "access_token";
pub const REFRESH_TOKEN: &str = "refresh_token";

/// Access tokens are accepted by the platform for a week.
pub const ACCESS_TOKEN_TTL_DAYS: i64 = 7;
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 30;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Credential vault I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential vault encryption error: {0}")]
    Crypto(String),

    #[error("Malformed stored credential: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Credential backend unavailable: {0}")]
    Unavailable(String),
}

/// A secret value together with the moment it stops being valid.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredSecret {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for StoredSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSecret")
            .field("value", &redact(&self.value))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Key/value storage for named secrets.
///
/// `delete` removes the entry if it exists; deleting a missing entry is not
/// an error.
pub trait CredentialBackend: Send + Sync {
    fn write(&self, name: &str, secret: &StoredSecret) -> Result<(), CredentialError>;

    fn read(&self, name: &str) -> Result<Option<StoredSecret>, CredentialError>;

    fn delete(&self, name: &str) -> Result<(), CredentialError>;

    /// Short label for logs.
    fn label(&self) -> &'static str;
}

impl<B: CredentialBackend + ?Sized> CredentialBackend for std::sync::Arc<B> {
    fn write(&self, name: &str, secret: &StoredSecret) -> Result<(), CredentialError> {
        (**self).write(name, secret)
    }

    fn read(&self, name: &str) -> Result<Option<StoredSecret>, CredentialError> {
        (**self).read(name)
    }

    fn delete(&self, name: &str) -> Result<(), CredentialError> {
        (**self).delete(name)
    }

    fn label(&self) -> &'static str {
        (**self).label()
    }
}

/// OS keychain backend. Each secret is one keychain entry holding the JSON
/// encoded [`StoredSecret`].
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<Entry, CredentialError> {
        Ok(Entry::new(&self.service, name)?)
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialBackend for KeyringBackend {
    fn write(&self, name: &str, secret: &StoredSecret) -> Result<(), CredentialError> {
        let encoded = serde_json::to_string(secret)?;
        self.entry(name)?.set_password(&encoded)?;
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<StoredSecret>, CredentialError> {
        match self.entry(name)?.get_password() {
            Ok(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<(), CredentialError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn label(&self) -> &'static str {
        "keyring"
    }
}

/// Process-lifetime backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, StoredSecret>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialBackend for MemoryBackend {
    fn write(&self, name: &str, secret: &StoredSecret) -> Result<(), CredentialError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), secret.clone());
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<StoredSecret>, CredentialError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    fn delete(&self, name: &str) -> Result<(), CredentialError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    fn label(&self) -> &'static str {
        "memory"
    }
}

/// The two secrets that make up a signed-in session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
}

impl CredentialStore {
    pub fn new(backend: impl CredentialBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn backend_label(&self) -> &'static str {
        self.backend.label()
    }

    pub fn set(&self, name: &str, value: &str, ttl: Duration) -> Result<(), CredentialError> {
        self.backend.write(name, &StoredSecret::new(value, ttl))
    }

    /// Current value of `name`, or `None` if missing or expired.
    pub fn get(&self, name: &str) -> Result<Option<String>, CredentialError> {
        match self.backend.read(name)? {
            Some(secret) if secret.is_expired() => {
                debug!(
                    credential = name,
                    expired_at = %secret.expires_at,
                    "Dropping expired credential"
                );
                if let Err(e) = self.backend.delete(name) {
                    warn!(credential = name, error = %e, "Failed to delete expired credential");
                }
                Ok(None)
            }
            Some(secret) => Ok(Some(secret.value)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, name: &str) -> Result<(), CredentialError> {
        self.backend.delete(name)
    }

    /// Write both secrets. If the refresh token cannot be written the whole
    /// pair is removed, so a failed call never leaves half of one behind.
    pub fn store_pair(&self, pair: &CredentialPair) -> Result<(), CredentialError> {
        self.set(
            ACCESS_TOKEN,
            &pair.access_token,
            Duration::days(ACCESS_TOKEN_TTL_DAYS),
        )?;
        if let Err(e) = self.set(
            REFRESH_TOKEN,
            &pair.refresh_token,
            Duration::days(REFRESH_TOKEN_TTL_DAYS),
        ) {
            for name in [ACCESS_TOKEN, REFRESH_TOKEN] {
                if let Err(rollback) = self.remove(name) {
                    warn!(credential = name, error = %rollback, "Failed to roll back credential");
                }
            }
            return Err(e);
        }
        debug!(backend = self.backend.label(), "Credential pair stored");
        Ok(())
    }

    /// Both secrets, if both are present and unexpired.
    pub fn load_pair(&self) -> Result<Option<CredentialPair>, CredentialError> {
        let Some(access_token) = self.get(ACCESS_TOKEN)? else {
            return Ok(None);
        };
        let Some(refresh_token) = self.get(REFRESH_TOKEN)? else {
            return Ok(None);
        };
        Ok(Some(CredentialPair {
            access_token,
            refresh_token,
        }))
    }

    pub fn access_token(&self) -> Result<Option<String>, CredentialError> {
        self.get(ACCESS_TOKEN)
    }

    /// Remove both secrets. Both deletions are attempted; the first failure
    /// is returned.
    pub fn clear_pair(&self) -> Result<(), CredentialError> {
        let access = self.remove(ACCESS_TOKEN);
        let refresh = self.remove(REFRESH_TOKEN);
        access.and(refresh)
    }
}
