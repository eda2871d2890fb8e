//! Session state and its transitions.
//!
//! The session keeps three things apart: the durable snapshot
//! (`{identity, authenticated}` in `session.json`), the credential pair (in
//! the [`CredentialStore`]), and the transient `loading` flag. Only the
//! snapshot survives a restart; `loading` is always re-derived.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::{Identity, IdentityPatch};

use super::credentials::{CredentialError, CredentialPair, CredentialStore};

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Observable session value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub identity: Option<Identity>,
    pub authenticated: bool,
    pub loading: bool,
}

impl SessionState {
    fn logged_out() -> Self {
        Self::default()
    }
}

/// The part of the session that survives a restart. Never holds secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub identity: Option<Identity>,
    pub authenticated: bool,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSession {
    fn from_state(state: &SessionState) -> Self {
        Self {
            identity: state.identity.clone(),
            authenticated: state.authenticated,
            saved_at: Utc::now(),
        }
    }

    /// A snapshot claiming `authenticated` without an identity cannot be
    /// trusted; treat it as logged out.
    fn normalized(self) -> Self {
        if self.authenticated && self.identity.is_none() {
            warn!("Persisted session is authenticated without identity, discarding");
            Self {
                authenticated: false,
                ..self
            }
        } else {
            self
        }
    }
}

/// Durable storage for [`PersistedSession`].
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>>;

    fn save(&self, session: &PersistedSession) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// `session.json` in the data directory.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionPersistence for FileSessionStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read session file")?;
        let session = serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(session))
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<PersistedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionPersistence for MemorySessionStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Owner of the session state and the only writer of the credential pair.
pub struct SessionManager {
    credentials: Arc<CredentialStore>,
    persistence: Box<dyn SessionPersistence>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(
        credentials: Arc<CredentialStore>,
        persistence: impl SessionPersistence + 'static,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::logged_out());
        Self {
            credentials,
            persistence: Box::new(persistence),
            state,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Load the durable snapshot. Called once at startup, before
    /// reconciliation. `loading` starts out `true` until reconciliation
    /// settles it.
    pub fn restore(&self) {
        let persisted = match self.persistence.load() {
            Ok(persisted) => persisted.map(PersistedSession::normalized),
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting logged out");
                None
            }
        };
        let (identity, authenticated) = persisted
            .map(|p| (p.identity, p.authenticated))
            .unwrap_or((None, false));
        debug!(
            authenticated,
            has_identity = identity.is_some(),
            "Session restored"
        );
        self.state.send_replace(SessionState {
            identity,
            authenticated,
            loading: true,
        });
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.borrow().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().authenticated
    }

    /// Store `credentials` and make `identity` the signed-in user, replacing
    /// any previous one. If the credentials cannot be stored the state is
    /// left untouched.
    pub fn login(
        &self,
        identity: Identity,
        credentials: &CredentialPair,
    ) -> Result<(), CredentialError> {
        self.credentials.store_pair(credentials)?;
        info!(user = %identity.username, "Logged in");
        let state = SessionState {
            identity: Some(identity),
            authenticated: true,
            loading: false,
        };
        self.persist(&state);
        self.state.send_replace(state);
        Ok(())
    }

    /// Forget the user and delete the credential pair. Safe to call when
    /// already logged out.
    pub fn logout(&self) {
        if let Err(e) = self.credentials.clear_pair() {
            warn!(error = %e, "Failed to delete stored credentials");
        }
        let changed = self.state.send_if_modified(|state| {
            let next = SessionState::logged_out();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!("Logged out");
        }
        if let Err(e) = self.persistence.clear() {
            warn!(error = %e, "Failed to clear persisted session");
        }
    }

    /// Shallow-merge `patch` into the current identity. Without an identity
    /// this does nothing.
    pub fn update_user(&self, patch: &IdentityPatch) {
        let mut updated = None;
        self.state.send_if_modified(|state| match state.identity.as_mut() {
            Some(identity) => {
                identity.apply(patch);
                updated = Some(state.clone());
                true
            }
            None => false,
        });
        match updated {
            Some(state) => {
                debug!("Identity updated");
                self.persist(&state);
            }
            None => debug!("Ignoring identity update without a signed-in user"),
        }
    }

    /// Set the transient loading flag. Persisted fields are not touched.
    pub fn set_loading(&self, loading: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.loading != loading;
            state.loading = loading;
            changed
        });
    }

    fn persist(&self, state: &SessionState) {
        if let Err(e) = self.persistence.save(&PersistedSession::from_state(state)) {
            warn!(error = %e, "Failed to persist session");
        }
    }
}
