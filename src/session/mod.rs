//! Worker Session Manager
//!
//! Owns the single upstream session. Establishes it with bounded backoff,
//! publishes every state change for operators, heals on transient upstream
//! errors, and logs out on shutdown to free the connection slot.
//!
//! State machine: `starting → ready ⇄ reconnecting → degraded → (ready on
//! success)`. Concurrency across handlers is forbidden by contract — the
//! dispatcher is the sole entry — so this type only guards its own state,
//! not the upstream calls.

pub mod catalog;
pub mod reconnect;

pub use catalog::{is_pseudo_symbol, pseudo_family, ContractCatalog};
pub use reconnect::{Backoff, BackoffConfig};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::broker::{AccountInfo, UpstreamError, UpstreamPort};
use crate::config::{SessionSettings, TradingMode};

/// Observable state of the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Initial login in progress.
    Starting,
    /// Session established; handlers may run.
    Ready,
    /// Healing after a transient upstream error.
    Reconnecting,
    /// Login attempts exhausted; every command is rejected until an operator
    /// intervenes or a later heal succeeds.
    Degraded,
}

impl SessionState {
    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manager for the one upstream session.
pub struct SessionManager {
    upstream: Arc<dyn UpstreamPort>,
    mode: TradingMode,
    settings: SessionSettings,
    supported: Vec<String>,
    state_tx: watch::Sender<SessionState>,
    catalog: RwLock<Option<Arc<ContractCatalog>>>,
    accounts: RwLock<Vec<AccountInfo>>,
    healing: AtomicBool,
}

impl SessionManager {
    /// Create a manager in the `starting` state.
    #[must_use]
    pub fn new(
        upstream: Arc<dyn UpstreamPort>,
        mode: TradingMode,
        settings: SessionSettings,
        supported: Vec<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Starting);
        Self {
            upstream,
            mode,
            settings,
            supported,
            state_tx,
            catalog: RwLock::new(None),
            accounts: RwLock::new(Vec::new()),
            healing: AtomicBool::new(false),
        }
    }

    /// Trading mode the session runs in.
    #[must_use]
    pub const fn mode(&self) -> TradingMode {
        self.mode
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Whether handlers may run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Watch state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// The contract catalog, once loaded.
    #[must_use]
    pub fn catalog(&self) -> Option<Arc<ContractCatalog>> {
        self.catalog.read().clone()
    }

    /// Accounts selected at login.
    #[must_use]
    pub fn accounts(&self) -> Vec<AccountInfo> {
        self.accounts.read().clone()
    }

    fn transition(&self, next: SessionState) {
        let previous = *self.state_tx.borrow();
        if previous != next {
            tracing::info!(from = %previous, to = %next, "session state changed");
            crate::metrics::set_session_state(next);
        }
        self.state_tx.send_replace(next);
    }

    /// Log in with exponential backoff until ready or the attempt budget is
    /// spent. Returns whether the session is ready.
    pub async fn establish(&self) -> bool {
        let mut backoff = Backoff::new(BackoffConfig::from(&self.settings));

        loop {
            match self.try_login().await {
                Ok(()) => {
                    self.transition(SessionState::Ready);
                    return true;
                }
                Err(err) => {
                    crate::metrics::record_login_failure();
                    match backoff.next_delay() {
                        Some(delay) => {
                            tracing::warn!(
                                error = %err,
                                attempt = backoff.attempts(),
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                "login failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(
                                error = %err,
                                attempts = backoff.attempts(),
                                "login attempts exhausted"
                            );
                            self.transition(SessionState::Degraded);
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn try_login(&self) -> Result<(), UpstreamError> {
        let summary = self.upstream.login(self.mode).await?;

        let signed: Vec<AccountInfo> = summary
            .accounts
            .into_iter()
            .filter(|account| account.signed)
            .collect();
        if signed.is_empty() {
            return Err(UpstreamError::AccountUnusable(
                "no signed account available after login".to_string(),
            ));
        }

        let catalog = Arc::new(ContractCatalog::new(summary.contracts, &self.supported));
        if catalog.is_empty() {
            return Err(UpstreamError::AccountUnusable(
                "contract catalog empty after login".to_string(),
            ));
        }

        tracing::info!(
            accounts = signed.len(),
            contracts = catalog.len(),
            mode = self.mode.as_str(),
            "session established"
        );

        *self.accounts.write() = signed;
        *self.catalog.write() = Some(catalog);
        Ok(())
    }

    /// Begin healing after a transient upstream error. Idempotent while a
    /// heal is in flight; the dispatcher keeps rejecting commands until the
    /// state returns to `ready`.
    pub fn begin_heal(self: &Arc<Self>) {
        if self.healing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transition(SessionState::Reconnecting);
        crate::metrics::record_reconnect();

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            // Best effort; the old session may already be dead.
            if let Err(err) = manager.upstream.logout().await {
                tracing::debug!(error = %err, "logout before heal failed");
            }
            manager.establish().await;
            manager.healing.store(false, Ordering::SeqCst);
        });
    }

    /// Log out cleanly, freeing the upstream connection slot.
    pub async fn shutdown(&self) {
        if let Err(err) = self.upstream.logout().await {
            tracing::warn!(error = %err, "logout on shutdown failed");
        } else {
            tracing::info!("session logged out");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
