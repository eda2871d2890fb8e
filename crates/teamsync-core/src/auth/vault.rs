//! Passphrase-protected credential file.
//!
//! Used where no OS keychain is available. The file is a JSON document with
//! a random salt and one sealed record per credential name. Each record is
//! XChaCha20-Poly1305 ciphertext under a key derived from the passphrase and
//! salt with Argon2id, bound to its credential name as associated data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use super::credentials::{CredentialBackend, CredentialError, StoredSecret};

pub const VAULT_FILE: &str = "credentials.vault";

const VAULT_VERSION: u32 = 1;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;
const KEY_SIZE: usize = 32;

#[derive(Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    salt: Vec<u8>,
    entries: BTreeMap<String, SealedEntry>,
}

#[derive(Serialize, Deserialize)]
struct SealedEntry {
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

impl VaultFile {
    fn empty() -> Self {
        Self {
            version: VAULT_VERSION,
            salt: random_bytes::<SALT_SIZE>().to_vec(),
            entries: BTreeMap::new(),
        }
    }
}

pub struct EncryptedFileBackend {
    path: PathBuf,
    passphrase: Zeroizing<String>,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl EncryptedFileBackend {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: Zeroizing::new(passphrase.into()),
            lock: Mutex::new(()),
        }
    }

    /// Vault at the standard file name inside `dir`.
    pub fn in_dir(dir: &Path, passphrase: impl Into<String>) -> Self {
        Self::new(dir.join(VAULT_FILE), passphrase)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<VaultFile>, CredentialError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let vault: VaultFile = serde_json::from_str(&contents)?;
        if vault.version != VAULT_VERSION {
            return Err(CredentialError::Unavailable(format!(
                "unsupported vault version {}",
                vault.version
            )));
        }
        Ok(Some(vault))
    }

    fn save(&self, vault: &VaultFile) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so a crash never leaves a truncated vault.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(vault)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn cipher(&self, salt: &[u8]) -> Result<XChaCha20Poly1305, CredentialError> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, key.as_mut_slice())
            .map_err(|e| CredentialError::Crypto(format!("key derivation failed: {}", e)))?;
        XChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|_| CredentialError::Crypto("invalid key length".into()))
    }

    fn seal(
        cipher: &XChaCha20Poly1305,
        name: &str,
        secret: &StoredSecret,
    ) -> Result<SealedEntry, CredentialError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(secret)?);
        let nonce = random_bytes::<NONCE_SIZE>();
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| CredentialError::Crypto("encryption failed".into()))?;
        Ok(SealedEntry {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    fn open(
        cipher: &XChaCha20Poly1305,
        name: &str,
        entry: &SealedEntry,
    ) -> Result<StoredSecret, CredentialError> {
        if entry.nonce.len() != NONCE_SIZE {
            return Err(CredentialError::Crypto("malformed nonce".into()));
        }
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(&entry.nonce),
                Payload {
                    msg: &entry.ciphertext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| {
                CredentialError::Crypto("wrong passphrase or corrupted vault".into())
            })?;
        let plaintext = Zeroizing::new(plaintext);
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl CredentialBackend for EncryptedFileBackend {
    fn write(&self, name: &str, secret: &StoredSecret) -> Result<(), CredentialError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut vault = self.load()?.unwrap_or_else(VaultFile::empty);
        let cipher = self.cipher(&vault.salt)?;
        let sealed = Self::seal(&cipher, name, secret)?;
        vault.entries.insert(name.to_string(), sealed);
        self.save(&vault)?;
        debug!(credential = name, path = %self.path.display(), "Credential sealed");
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<StoredSecret>, CredentialError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(vault) = self.load()? else {
            return Ok(None);
        };
        let Some(entry) = vault.entries.get(name) else {
            return Ok(None);
        };
        let cipher = self.cipher(&vault.salt)?;
        Self::open(&cipher, name, entry).map(Some)
    }

    fn delete(&self, name: &str) -> Result<(), CredentialError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut vault) = self.load()? else {
            return Ok(());
        };
        if vault.entries.remove(name).is_some() {
            self.save(&vault)?;
        }
        Ok(())
    }

    fn label(&self) -> &'static str {
        "encrypted_file"
    }
}
