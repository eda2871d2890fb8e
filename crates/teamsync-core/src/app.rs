//! Application context for TeamSync.
//!
//! `AppContext` is built once at process start and owns everything a
//! consumer needs: configuration, the session (and through it the credential
//! store), the boot-time initializer, and the query client. Consumers pass
//! it around explicitly; there is no global state.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::api::{ApiClient, EntityService, IdentityVerifier};
use crate::auth::{
    BootReport, CredentialError, CredentialPair, CredentialStore, EncryptedFileBackend,
    FileSessionStore, InitializerConfig, KeyringBackend, SessionInitializer, SessionManager,
};
use crate::cache::{
    FetchResult, Mutation, MutationError, Query, QueryClient, QueryError, QueryObserver,
};
use crate::config::{Config, CredentialBackendKind, ENV_VAULT_PASSPHRASE};
use crate::models::{Identity, IdentityPatch};

// ============================================================================
// Construction
// ============================================================================

/// Build the credential store the configuration asks for.
pub fn credential_store(config: &Config, data_dir: &Path) -> Result<CredentialStore> {
    let store = match config.credential_backend {
        CredentialBackendKind::Keyring => CredentialStore::new(KeyringBackend::new()),
        CredentialBackendKind::EncryptedFile => {
            let passphrase = config.vault_passphrase.clone().with_context(|| {
                format!("The encrypted credential file needs {}", ENV_VAULT_PASSPHRASE)
            })?;
            CredentialStore::new(EncryptedFileBackend::in_dir(data_dir, passphrase))
        }
        CredentialBackendKind::Memory => CredentialStore::in_memory(),
    };
    debug!(backend = store.backend_label(), "Credential store ready");
    Ok(store)
}

pub struct AppContext<C = ApiClient> {
    config: Config,
    session: Arc<SessionManager>,
    initializer: SessionInitializer<C>,
    queries: QueryClient<C>,
    platform: Arc<C>,
}

impl AppContext<ApiClient> {
    /// Wire the production stack: configured credential backend, the
    /// session snapshot in the data directory, and the HTTP client.
    pub fn from_config(config: Config) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let credentials = Arc::new(credential_store(&config, &data_dir)?);
        let platform = Arc::new(ApiClient::new(
            &config.api_base_url,
            config.request_timeout(),
            Arc::clone(&credentials),
        )?);
        let session = Arc::new(SessionManager::new(
            credentials,
            FileSessionStore::new(&data_dir),
        ));
        Ok(Self::new(config, session, platform))
    }

    /// Exchange a password for credentials and sign in.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity> {
        let (identity, pair) = self
            .platform
            .authenticate(email, password)
            .await
            .context("Sign-in was rejected")?;
        self.login(identity.clone(), &pair)
            .context("Failed to store credentials")?;
        Ok(identity)
    }
}

impl<C: IdentityVerifier + EntityService> AppContext<C> {
    pub fn new(config: Config, session: Arc<SessionManager>, platform: Arc<C>) -> Self {
        let initializer = SessionInitializer::new(
            Arc::clone(&session),
            Arc::clone(&platform),
            InitializerConfig {
                verification_timeout: config.verification_timeout(),
                ..InitializerConfig::default()
            },
        );
        let queries = QueryClient::new(Arc::clone(&platform), config.default_stale_time());
        Self {
            config,
            session,
            initializer,
            queries,
            platform,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn initializer(&self) -> &SessionInitializer<C> {
        &self.initializer
    }

    pub fn queries(&self) -> &QueryClient<C> {
        &self.queries
    }

    pub fn platform(&self) -> &Arc<C> {
        &self.platform
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Restore the durable snapshot and reconcile it with the stored
    /// credential. Returns once settled or once the timeout guard fires.
    pub async fn boot(&self) -> BootReport {
        self.session.restore();
        let report = self.initializer.run().await;
        info!(phase = ?report.phase, timed_out = report.timed_out, "Boot finished");
        report
    }

    /// Sign in as `identity`. Switching to a different user drops every
    /// cached entry first. The boot phase follows the new credential.
    pub fn login(&self, identity: Identity, pair: &CredentialPair) -> Result<(), CredentialError> {
        let switching = self
            .session
            .identity()
            .is_some_and(|current| current.id != identity.id);
        if switching {
            self.queries.cache().clear();
        }
        self.session.login(identity, pair)?;
        self.initializer.evaluate();
        Ok(())
    }

    /// Sign out and forget everything fetched for the previous user.
    pub fn logout(&self) {
        self.session.logout();
        self.queries.cache().clear();
        self.initializer.evaluate();
    }

    // ========================================================================
    // Data
    // ========================================================================

    pub async fn query(&self, query: &Query) -> FetchResult {
        self.queries.fetch(query).await
    }

    pub async fn query_as<T: DeserializeOwned>(&self, query: &Query) -> Result<T, QueryError> {
        self.queries.fetch_as(query).await
    }

    pub fn observe(&self, query: &Query) -> QueryObserver {
        self.queries.observe(query)
    }

    /// Perform a write. A successful profile update is also merged into the
    /// session identity, preferring the profile the server returned.
    pub async fn mutate(&self, mutation: &Mutation) -> Result<Value, MutationError> {
        let value = self.queries.mutate(mutation).await?;
        if let Mutation::UpdateProfile { patch } = mutation {
            let returned = IdentityPatch::deserialize(&value)
                .ok()
                .filter(|p| !p.is_empty());
            self.session.update_user(returned.as_ref().unwrap_or(patch));
        }
        Ok(value)
    }
}
