//! Authentication: credential storage, session state, startup reconciliation.
//!
//! This module provides:
//! - `CredentialStore`: the access/refresh pair behind a pluggable backend
//!   (OS keychain, encrypted file, memory)
//! - `SessionManager`: identity, `authenticated` and `loading`, with a
//!   durable snapshot that never contains secrets
//! - `SessionInitializer`: boot-time verification under a timeout guard

pub mod credentials;
pub mod initializer;
pub mod session;
pub mod vault;

pub use credentials::{
    CredentialBackend, CredentialError, CredentialPair, CredentialStore, KeyringBackend,
    MemoryBackend, StoredSecret, ACCESS_TOKEN, REFRESH_TOKEN,
};
pub use initializer::{BootPhase, BootReport, InitializerConfig, SessionInitializer};
pub use session::{
    FileSessionStore, MemorySessionStore, PersistedSession, SessionManager, SessionPersistence,
    SessionState,
};
pub use vault::EncryptedFileBackend;
