//! Startup reconciliation of the session.
//!
//! Derives a definitive session from the restored snapshot, the stored
//! credentials and one live identity check:
//!
//! ```text
//! no access token            -> NoCredential   (logout, loading off)
//! token + identity held      -> Authenticated  (no request)
//! token, no identity         -> Verifying      (one request, loading on)
//!     verified               -> Authenticated  (login with stored pair)
//!     rejected / failed      -> Invalid        (logout, credentials removed)
//!     newer login meanwhile  -> Authenticated  (the newer login is kept)
//! ```
//!
//! A watchdog bounds how long `loading` can stay on. When it fires it only
//! switches `loading` off; a verification result that arrives afterwards
//! still applies.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, IdentityVerifier};
use crate::models::Identity;

use super::session::SessionManager;

const DEFAULT_VERIFICATION_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    /// Reconciliation has not run yet.
    Pending,
    NoCredential,
    Verifying,
    Authenticated,
    Invalid,
}

impl BootPhase {
    /// True for the phases that end a boot cycle.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            BootPhase::NoCredential | BootPhase::Authenticated | BootPhase::Invalid
        )
    }
}

#[derive(Debug, Clone)]
pub struct InitializerConfig {
    /// Upper bound on the loading state.
    pub verification_timeout: Duration,
    /// Total verification attempts; only transient failures are retried.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            verification_timeout: Duration::from_secs(DEFAULT_VERIFICATION_TIMEOUT_SECS),
            max_attempts: 2,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Outcome of [`SessionInitializer::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    /// Phase reached when `run` returned. `Verifying` if the guard fired.
    pub phase: BootPhase,
    /// The loading bound elapsed before a verdict.
    pub timed_out: bool,
}

struct Inner<V> {
    session: Arc<SessionManager>,
    verifier: Arc<V>,
    config: InitializerConfig,
    phase: watch::Sender<BootPhase>,
    verifying: AtomicBool,
    // Boot cycle counter; a watchdog only acts on its own cycle.
    boot: AtomicU64,
}

pub struct SessionInitializer<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for SessionInitializer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: IdentityVerifier> SessionInitializer<V> {
    pub fn new(session: Arc<SessionManager>, verifier: Arc<V>, config: InitializerConfig) -> Self {
        let (phase, _) = watch::channel(BootPhase::Pending);
        Self {
            inner: Arc::new(Inner {
                session,
                verifier,
                config,
                phase,
                verifying: AtomicBool::new(false),
                boot: AtomicU64::new(0),
            }),
        }
    }

    pub fn phase(&self) -> BootPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootPhase> {
        self.inner.phase.subscribe()
    }

    /// Start a boot cycle: arm the watchdog and evaluate once. Returns
    /// without waiting for verification. Must be called within a Tokio
    /// runtime.
    pub fn start(&self) -> BootPhase {
        let boot = self.inner.boot.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.verification_timeout).await;
            if inner.boot.load(Ordering::SeqCst) == boot && inner.session.state().loading {
                warn!(
                    timeout_secs = inner.config.verification_timeout.as_secs_f64(),
                    "Session still loading at deadline, forcing loading off"
                );
                inner.session.set_loading(false);
            }
        });
        self.evaluate()
    }

    /// Boot and wait for a verdict, at most the configured timeout.
    pub async fn run(&self) -> BootReport {
        let phase = self.start();
        if phase.is_settled() {
            return BootReport {
                phase,
                timed_out: false,
            };
        }

        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            self.inner.config.verification_timeout,
            rx.wait_for(BootPhase::is_settled),
        )
        .await;
        match waited {
            Ok(Ok(phase)) => BootReport {
                phase: *phase,
                timed_out: false,
            },
            // Sender lives in `inner`, which we hold; treat a closed channel
            // like an elapsed wait.
            Ok(Err(_)) | Err(_) => {
                self.inner.session.set_loading(false);
                BootReport {
                    phase: self.phase(),
                    timed_out: true,
                }
            }
        }
    }

    /// Apply the transition rules to the current credential and session
    /// state. Safe to call repeatedly; while a verification is outstanding
    /// it returns `Verifying` without issuing another.
    pub fn evaluate(&self) -> BootPhase {
        let inner = &self.inner;
        if inner.verifying.load(Ordering::SeqCst) {
            debug!("Verification already in flight");
            return BootPhase::Verifying;
        }

        let token = match inner.session.credentials().access_token() {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Could not read stored credentials");
                None
            }
        };
        let Some(token) = token else {
            debug!("No stored credential");
            inner.session.logout();
            return inner.settle(BootPhase::NoCredential);
        };

        if inner.session.identity().is_some() {
            debug!("Identity already held, skipping verification");
            inner.session.set_loading(false);
            return inner.settle(BootPhase::Authenticated);
        }

        if inner
            .verifying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return BootPhase::Verifying;
        }
        inner.session.set_loading(true);
        inner.phase.send_replace(BootPhase::Verifying);
        info!("Verifying stored credential");
        tokio::spawn(Inner::verify(Arc::clone(inner), token));
        BootPhase::Verifying
    }
}

impl<V: IdentityVerifier> Inner<V> {
    fn settle(&self, phase: BootPhase) -> BootPhase {
        self.phase.send_replace(phase);
        phase
    }

    async fn check(&self, token: &str) -> Result<Identity, ApiError> {
        let mut attempt = 1;
        loop {
            match self.verifier.verify(token).await {
                Ok(identity) => return Ok(identity),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(attempt, error = %e, "Identity verification failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn verify(self: Arc<Self>, token: String) {
        let outcome = self.check(&token).await;
        let phase = match outcome {
            Ok(identity) => self.accept(identity),
            Err(e) if self.superseded(&token) => {
                debug!(error = %e, "Credential rejected after a newer login, keeping it");
                self.session.set_loading(false);
                BootPhase::Authenticated
            }
            Err(e) => {
                info!(error = %e, "Stored credential rejected, logging out");
                self.session.logout();
                BootPhase::Invalid
            }
        };
        self.verifying.store(false, Ordering::SeqCst);
        self.settle(phase);
    }

    /// A login happened while `token` was being checked.
    fn superseded(&self, token: &str) -> bool {
        if self.session.identity().is_some() {
            return true;
        }
        match self.session.credentials().access_token() {
            Ok(Some(current)) => current != token,
            _ => false,
        }
    }

    fn accept(&self, identity: Identity) -> BootPhase {
        if self.session.identity().is_some() {
            // Someone logged in while we were waiting; theirs is newer.
            debug!("Identity appeared during verification, keeping it");
            self.session.set_loading(false);
            return BootPhase::Authenticated;
        }
        match self.session.credentials().load_pair() {
            Ok(Some(pair)) => match self.session.login(identity, &pair) {
                Ok(()) => BootPhase::Authenticated,
                Err(e) => {
                    warn!(error = %e, "Could not re-store credentials after verification");
                    self.session.logout();
                    BootPhase::Invalid
                }
            },
            Ok(None) => {
                info!("Credentials removed during verification");
                self.session.logout();
                BootPhase::NoCredential
            }
            Err(e) => {
                warn!(error = %e, "Could not read credentials after verification");
                self.session.logout();
                BootPhase::Invalid
            }
        }
    }
}
