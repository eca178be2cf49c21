//! Portal coordinator
//!
//! Owns the session authority, the filter enforcer and the credential
//! validator, and keeps the packet filter a projection of the authority.
//!
//! # Architecture
//!
//! ```text
//!   login / check / logout / revoke / sweep
//!                  |
//!                  v
//!         SessionAuthority  (commit transition, no I/O)
//!                  |
//!                  v  identities whose state changed
//!         reconcile(identity)
//!           stripe lock (per identity, async)
//!           live = authority.is_live(identity)
//!           live ? enforcer.allow : enforcer.block
//! ```
//!
//! The enforcer is always invoked after the transition has committed and
//! outside every session lock. Re-reading the authority under the stripe
//! lock means that two racing transitions on one identity leave the filter
//! matching whichever transition committed last.

mod sweeper;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use sweeper::Sweeper;

use crate::auth::CredentialValidator;
use crate::enforcer::FilterEnforcer;
use crate::error::{EnforcementError, LoginError, SessionError};
use crate::session::{
    Authorization, AuthorityStatsSnapshot, CorroborationMode, CorroboratorSource,
    SessionAuthority, SessionToken, SessionView,
};

/// Number of per-identity enforcement locks
const STRIPES: usize = 64;

/// Portal-level counters
#[derive(Debug, Default)]
pub struct PortalStats {
    pub logins: AtomicU64,
    pub login_failures: AtomicU64,
    pub logouts: AtomicU64,
    pub allows: AtomicU64,
    pub blocks: AtomicU64,
    pub enforcement_failures: AtomicU64,
    pub sweeps: AtomicU64,
}

impl PortalStats {
    #[must_use]
    pub fn snapshot(&self) -> PortalStatsSnapshot {
        PortalStatsSnapshot {
            logins: self.logins.load(Ordering::Relaxed),
            login_failures: self.login_failures.load(Ordering::Relaxed),
            logouts: self.logouts.load(Ordering::Relaxed),
            allows: self.allows.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            enforcement_failures: self.enforcement_failures.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PortalStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalStatsSnapshot {
    pub logins: u64,
    pub login_failures: u64,
    pub logouts: u64,
    pub allows: u64,
    pub blocks: u64,
    pub enforcement_failures: u64,
    pub sweeps: u64,
}

/// Status report for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalStatus {
    pub uptime_secs: u64,
    pub enforcer: String,
    pub sessions: Vec<SessionView>,
    /// `None` when the filter could not be listed
    pub allowed: Option<Vec<IpAddr>>,
    pub authority: AuthorityStatsSnapshot,
    pub portal: PortalStatsSnapshot,
}

/// Coordinates session transitions with packet-filter enforcement
pub struct Portal {
    authority: SessionAuthority,
    enforcer: Arc<dyn FilterEnforcer>,
    validator: Arc<dyn CredentialValidator>,
    corroborators: Arc<dyn CorroboratorSource>,
    stripes: Vec<Mutex<()>>,
    stats: PortalStats,
    started_at: Instant,
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("enforcer", &self.enforcer.name())
            .field("sessions", &self.authority.len())
            .finish_non_exhaustive()
    }
}

impl Portal {
    #[must_use]
    pub fn new(
        authority: SessionAuthority,
        enforcer: Arc<dyn FilterEnforcer>,
        validator: Arc<dyn CredentialValidator>,
        corroborators: Arc<dyn CorroboratorSource>,
    ) -> Self {
        Self {
            authority,
            enforcer,
            validator,
            corroborators,
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            stats: PortalStats::default(),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn authority(&self) -> &SessionAuthority {
        &self.authority
    }

    #[must_use]
    pub const fn stats(&self) -> &PortalStats {
        &self.stats
    }

    /// Install the filter baseline
    ///
    /// # Errors
    ///
    /// Returns the enforcer error; the caller decides whether to continue.
    pub async fn initialize(&self) -> Result<(), EnforcementError> {
        info!(backend = self.enforcer.name(), "Installing filter baseline");
        self.enforcer.initialize().await
    }

    /// Validate credentials and open a session for `identity`
    ///
    /// # Errors
    ///
    /// [`LoginError::InvalidCredentials`] when validation fails (no session
    /// is created), or the authority's refusal under the reject policy.
    pub async fn login(
        &self,
        identity: IpAddr,
        username: &str,
        password: &str,
    ) -> Result<SessionToken, LoginError> {
        if username.is_empty() || !self.validator.validate(username, password) {
            self.stats.login_failures.fetch_add(1, Ordering::Relaxed);
            warn!(identity = %identity, username, "Login failed: invalid credentials");
            return Err(LoginError::InvalidCredentials);
        }

        let corroborator = self.corroborators.lookup(identity).await;
        let created = self
            .authority
            .create(identity, corroborator, username, Instant::now())
            .map_err(|e| {
                self.stats.login_failures.fetch_add(1, Ordering::Relaxed);
                warn!(identity = %identity, username, error = %e, "Login refused");
                e
            })?;

        self.stats.logins.fetch_add(1, Ordering::Relaxed);
        info!(
            identity = %identity,
            principal = username,
            corroborator = ?corroborator,
            replaced = created.replaced,
            "Login succeeded"
        );

        self.reconcile(identity).await;
        Ok(created.token)
    }

    /// Authorize a request from `identity` carrying `token`
    ///
    /// Any transition caused by the check (expiry, mismatch, migration) is
    /// projected onto the filter before returning.
    ///
    /// # Errors
    ///
    /// The [`SessionError`] explaining why the request is not authorized.
    pub async fn check(
        &self,
        identity: IpAddr,
        token: Option<&str>,
    ) -> Result<Authorization, SessionError> {
        let Some(token) = token else {
            return Err(SessionError::Unauthenticated { identity });
        };

        let observed = match self.authority.config().corroboration {
            CorroborationMode::Disabled => None,
            CorroborationMode::Strict | CorroborationMode::Migrate => {
                self.corroborators.lookup(identity).await
            }
        };

        let result = self
            .authority
            .authorize(identity, token, observed, Instant::now());

        match &result {
            Ok(Authorization::Authorized { .. }) => {}
            Ok(Authorization::Migrated { from, .. }) => {
                self.reconcile(*from).await;
                self.reconcile(identity).await;
            }
            Err(SessionError::IdentityMismatch {
                identity: requester,
                session_identity,
            }) => {
                warn!(
                    identity = %requester,
                    session_identity = %session_identity,
                    "Possible spoofing, blocking both addresses"
                );
                self.reconcile(*session_identity).await;
                if session_identity != requester {
                    self.reconcile(*requester).await;
                }
            }
            Err(SessionError::Expired { identity: expired }) => {
                debug!(identity = %expired, "Presented token belongs to an expired session");
                self.reconcile(*expired).await;
            }
            Err(e) => debug!(identity = %identity, error = %e, "Request not authorized"),
        }

        result
    }

    /// Explicit logout: destroy the session and cut `identity` off
    ///
    /// The block is issued whether or not a session existed.
    pub async fn logout(&self, identity: IpAddr) -> bool {
        let existed = self.authority.revoke(identity, Instant::now());
        if existed {
            self.stats.logouts.fetch_add(1, Ordering::Relaxed);
        }
        info!(identity = %identity, existed, "Logout");
        self.reconcile(identity).await;
        existed
    }

    /// Operator revocation; same path as [`Portal::logout`]
    pub async fn revoke(&self, identity: IpAddr) -> bool {
        let existed = self.authority.revoke(identity, Instant::now());
        info!(identity = %identity, existed, "Session revoked by operator");
        self.reconcile(identity).await;
        existed
    }

    /// Expire idle sessions and block their identities
    ///
    /// Returns the expired identities.
    pub async fn sweep(&self) -> Vec<IpAddr> {
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        let expired = self.authority.sweep(Instant::now());
        if !expired.is_empty() {
            info!(count = expired.len(), "Sweep expired sessions");
        }
        for identity in &expired {
            self.reconcile(*identity).await;
        }
        expired
    }

    /// Destroy every session and block every identity that held one
    pub async fn revoke_all(&self) -> Vec<IpAddr> {
        let drained = self.authority.drain();
        info!(count = drained.len(), "Revoking all sessions");
        for identity in &drained {
            self.reconcile(*identity).await;
        }
        drained
    }

    /// Revert the filter to a fully open baseline
    ///
    /// # Errors
    ///
    /// Returns the enforcer error.
    pub async fn teardown(&self) -> Result<(), EnforcementError> {
        info!(backend = self.enforcer.name(), "Reverting filter baseline");
        self.enforcer.teardown().await
    }

    /// Install the filter baseline, then run `bind`
    ///
    /// A failure to install the baseline is logged and startup continues.
    /// When `bind` fails the baseline is reverted before its error is
    /// returned, so no listener means no default-deny filter either.
    ///
    /// # Errors
    ///
    /// Returns the error from `bind`.
    pub async fn start<T, E, F>(&self, bind: F) -> Result<T, E>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if let Err(e) = self.initialize().await {
            error!(error = %e, "Packet filter baseline incomplete, continuing");
        }

        match bind.await {
            Ok(bound) => Ok(bound),
            Err(e) => {
                error!(error = %e, "Startup failed, reverting filter baseline");
                if let Err(e) = self.teardown().await {
                    error!(error = %e, "Failed to revert filter baseline");
                }
                Err(e)
            }
        }
    }

    /// Sessions, filter view and counters
    pub async fn status(&self) -> PortalStatus {
        let allowed = match self.enforcer.list_allowed().await {
            Ok(allowed) => Some(allowed),
            Err(e) => {
                warn!(error = %e, "Failed to list filter accept rules");
                None
            }
        };

        PortalStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            enforcer: self.enforcer.name().to_string(),
            sessions: self.authority.list(Instant::now()),
            allowed,
            authority: self.authority.stats().snapshot(),
            portal: self.stats.snapshot(),
        }
    }

    /// Make the filter agree with the authority for `identity`
    async fn reconcile(&self, identity: IpAddr) {
        let _guard = self.stripe(identity).lock().await;

        let live = self.authority.is_live(identity, Instant::now());
        let (operation, result) = if live {
            self.stats.allows.fetch_add(1, Ordering::Relaxed);
            ("allow", self.enforcer.allow(identity).await)
        } else {
            self.stats.blocks.fetch_add(1, Ordering::Relaxed);
            ("block", self.enforcer.block(identity).await)
        };

        if let Err(e) = result {
            self.stats.enforcement_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                identity = %identity,
                operation,
                error = %e,
                "Enforcement failed; filter may disagree with session state"
            );
        }
    }

    fn stripe(&self, identity: IpAddr) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = hasher.finish() as usize % self.stripes.len();
        &self.stripes[index]
    }
}
