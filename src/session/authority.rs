//! Session Authority: the single source of truth for who is authorized
//!
//! # Architecture
//!
//! ```text
//!   sessions: DashMap<IpAddr, Session>        tokens: DashMap<SessionToken, IpAddr>
//!   +-----------+------------------+           +-----------+-----------+
//!   | 10.0.0.5  | alice, tok-A ... |  <------  | tok-A     | 10.0.0.5  |
//!   | 10.0.0.9  | bob,   tok-B ... |  <------  | tok-B     | 10.0.0.9  |
//!   +-----------+------------------+           +-----------+-----------+
//! ```
//!
//! Every transition on an identity runs while holding that identity's shard
//! entry in `sessions`, which gives a strict total order per identity and
//! independence across shards. A `tokens` guard is never held while a
//! `sessions` lock is acquired (lock order: `sessions` then `tokens`).
//!
//! The authority never talks to the packet filter. Callers learn which
//! identities changed state from return values and project that onto the
//! filter themselves.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{
    CorroborationMode, DuplicateLoginPolicy, MacAddr, Session, SessionToken, SessionView,
};
use crate::error::SessionError;

/// Authority tuning
#[derive(Debug, Clone, Copy)]
pub struct AuthorityConfig {
    /// Idle time after which a session is no longer live
    pub timeout: Duration,
    pub duplicate_login: DuplicateLoginPolicy,
    pub corroboration: CorroborationMode,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            duplicate_login: DuplicateLoginPolicy::default(),
            corroboration: CorroborationMode::default(),
        }
    }
}

/// Result of a successful `create`
#[derive(Debug, Clone)]
pub struct Created {
    pub token: SessionToken,
    /// Whether a previous session for the identity was replaced
    pub replaced: bool,
}

/// Result of a successful `authorize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Token matched the session held by this identity
    Authorized { principal: String },
    /// Token belonged to `from`; the session now lives at the requesting identity
    Migrated { principal: String, from: IpAddr },
}

impl Authorization {
    #[must_use]
    pub fn principal(&self) -> &str {
        match self {
            Self::Authorized { principal } | Self::Migrated { principal, .. } => principal,
        }
    }
}

/// Counters for status reporting
#[derive(Debug, Default)]
pub struct AuthorityStats {
    pub created: AtomicU64,
    pub replaced: AtomicU64,
    pub authorized: AtomicU64,
    pub rejected: AtomicU64,
    pub mismatches: AtomicU64,
    pub migrations: AtomicU64,
    pub expired: AtomicU64,
    pub revoked: AtomicU64,
}

impl AuthorityStats {
    #[must_use]
    pub fn snapshot(&self) -> AuthorityStatsSnapshot {
        AuthorityStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            authorized: self.authorized.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            revoked: self.revoked.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AuthorityStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthorityStatsSnapshot {
    pub created: u64,
    pub replaced: u64,
    pub authorized: u64,
    pub rejected: u64,
    pub mismatches: u64,
    pub migrations: u64,
    pub expired: u64,
    pub revoked: u64,
}

/// In-memory session table keyed by network identity
#[derive(Debug)]
pub struct SessionAuthority {
    sessions: DashMap<IpAddr, Session>,
    tokens: DashMap<SessionToken, IpAddr>,
    config: AuthorityConfig,
    stats: AuthorityStats,
}

impl SessionAuthority {
    #[must_use]
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            config,
            stats: AuthorityStats::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &AuthorityStats {
        &self.stats
    }

    /// Create a session for `identity`
    ///
    /// With [`DuplicateLoginPolicy::Replace`] an existing session is replaced
    /// and its token stops working. With [`DuplicateLoginPolicy::Reject`] a
    /// live session causes [`SessionError::AlreadyAuthorized`]; an expired
    /// one is replaced regardless of policy.
    pub fn create(
        &self,
        identity: IpAddr,
        corroborator: Option<MacAddr>,
        principal: &str,
        now: Instant,
    ) -> Result<Created, SessionError> {
        let session = Session::new(identity, corroborator, principal.to_string(), now);
        let token = session.token.clone();

        let replaced = match self.sessions.entry(identity) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(now, self.config.timeout);
                if live && self.config.duplicate_login == DuplicateLoginPolicy::Reject {
                    return Err(SessionError::AlreadyAuthorized { identity });
                }
                let previous = occupied.insert(session);
                self.tokens.remove(&previous.token);
                self.tokens.insert(token.clone(), identity);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                self.tokens.insert(token.clone(), identity);
                false
            }
        };

        self.stats.created.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.stats.replaced.fetch_add(1, Ordering::Relaxed);
            debug!(identity = %identity, principal, "Replaced existing session");
        }
        info!(identity = %identity, principal, "Session created");

        Ok(Created { token, replaced })
    }

    /// Check a request from `identity` presenting `token`
    ///
    /// On success `last_seen_at` is refreshed. A corroboration mismatch
    /// destroys the session (the caller must block the affected identities)
    /// and never refreshes it.
    pub fn authorize(
        &self,
        identity: IpAddr,
        token: &str,
        observed: Option<MacAddr>,
        now: Instant,
    ) -> Result<Authorization, SessionError> {
        // Copy out and release the index before touching `sessions`
        let Some(owner) = self.tokens.get(token).map(|entry| *entry.value()) else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SessionError::Unauthenticated { identity });
        };

        let result = if owner == identity {
            self.authorize_in_place(identity, token, observed, now)
        } else {
            self.authorize_moved(identity, owner, token, observed, now)
        };

        match &result {
            Ok(Authorization::Authorized { .. }) => {
                self.stats.authorized.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Authorization::Migrated { .. }) => {
                self.stats.authorized.fetch_add(1, Ordering::Relaxed);
                self.stats.migrations.fetch_add(1, Ordering::Relaxed);
            }
            Err(SessionError::IdentityMismatch { .. }) => {
                self.stats.mismatches.fetch_add(1, Ordering::Relaxed);
            }
            Err(SessionError::Expired { .. }) => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    fn authorize_in_place(
        &self,
        identity: IpAddr,
        token: &str,
        observed: Option<MacAddr>,
        now: Instant,
    ) -> Result<Authorization, SessionError> {
        let Entry::Occupied(mut occupied) = self.sessions.entry(identity) else {
            return Err(SessionError::Unauthenticated { identity });
        };

        // The session may have been replaced after the index lookup
        if !occupied.get().token.matches(token) {
            return Err(SessionError::Unauthenticated { identity });
        }

        if !occupied.get().is_live(now, self.config.timeout) {
            let session = occupied.remove();
            self.tokens.remove(&session.token);
            debug!(identity = %identity, "Session expired at authorization");
            return Err(SessionError::Expired { identity });
        }

        if self.config.corroboration != CorroborationMode::Disabled {
            if let (Some(known), Some(seen)) = (occupied.get().corroborator, observed) {
                if known != seen {
                    let session = occupied.remove();
                    self.tokens.remove(&session.token);
                    warn!(
                        identity = %identity,
                        principal = %session.principal,
                        expected = %known,
                        observed = %seen,
                        "Link-layer address changed under a live session, destroying it"
                    );
                    return Err(SessionError::IdentityMismatch {
                        identity,
                        session_identity: identity,
                    });
                }
            }
        }

        let session = occupied.get_mut();
        if session.corroborator.is_none() && self.config.corroboration != CorroborationMode::Disabled {
            session.corroborator = observed;
        }
        session.touch(now);

        Ok(Authorization::Authorized {
            principal: session.principal.clone(),
        })
    }

    fn authorize_moved(
        &self,
        identity: IpAddr,
        owner: IpAddr,
        token: &str,
        observed: Option<MacAddr>,
        now: Instant,
    ) -> Result<Authorization, SessionError> {
        // Detach the session from its old identity atomically
        let Some((_, mut session)) = self
            .sessions
            .remove_if(&owner, |_, session| session.token.matches(token))
        else {
            return Err(SessionError::Unauthenticated { identity });
        };

        if !session.is_live(now, self.config.timeout) {
            self.tokens.remove(&session.token);
            debug!(identity = %owner, "Session expired at authorization");
            return Err(SessionError::Expired { identity: owner });
        }

        let corroborated = matches!(
            (session.corroborator, observed),
            (Some(known), Some(seen)) if known == seen
        );

        if self.config.corroboration != CorroborationMode::Migrate || !corroborated {
            self.tokens.remove(&session.token);
            warn!(
                identity = %identity,
                session_identity = %owner,
                principal = %session.principal,
                "Token presented from a different address, destroying session"
            );
            return Err(SessionError::IdentityMismatch {
                identity,
                session_identity: owner,
            });
        }

        session.identity = identity;
        session.touch(now);
        let principal = session.principal.clone();
        let moved_token = session.token.clone();

        match self.sessions.entry(identity) {
            Entry::Occupied(mut occupied) => {
                let displaced = occupied.insert(session);
                self.tokens.remove(&displaced.token);
                self.tokens.insert(moved_token, identity);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                self.tokens.insert(moved_token, identity);
            }
        }

        warn!(
            identity = %identity,
            from = %owner,
            principal = %principal,
            "Session migrated to new address on matching link-layer address"
        );

        Ok(Authorization::Migrated {
            principal,
            from: owner,
        })
    }

    /// Destroy the session for `identity`
    ///
    /// Returns whether a live one existed. A session already past its idle
    /// deadline is still removed but counts as expired, not revoked.
    pub fn revoke(&self, identity: IpAddr, now: Instant) -> bool {
        let Some(session) = self.take(identity) else {
            return false;
        };
        if !session.is_live(now, self.config.timeout) {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            info!(identity = %identity, principal = %session.principal, "Expired session removed");
            return false;
        }
        self.stats.revoked.fetch_add(1, Ordering::Relaxed);
        info!(identity = %identity, principal = %session.principal, "Session revoked");
        true
    }

    fn take(&self, identity: IpAddr) -> Option<Session> {
        let (_, session) = self.sessions.remove(&identity)?;
        self.tokens.remove(&session.token);
        Some(session)
    }

    /// Destroy every session idle for longer than the timeout
    ///
    /// Each destroyed identity is returned exactly once, even when sweeps
    /// run concurrently.
    pub fn sweep(&self, now: Instant) -> Vec<IpAddr> {
        let timeout = self.config.timeout;
        let candidates: Vec<IpAddr> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_live(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for identity in candidates {
            // Re-check under the entry lock; the session may have been renewed
            if let Some((_, session)) = self
                .sessions
                .remove_if(&identity, |_, session| !session.is_live(now, timeout))
            {
                self.tokens.remove(&session.token);
                info!(
                    identity = %identity,
                    principal = %session.principal,
                    idle_secs = session.idle(now).as_secs(),
                    "Session expired"
                );
                expired.push(identity);
            }
        }

        if !expired.is_empty() {
            self.stats
                .expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        expired
    }

    /// Whether `identity` currently holds a live session
    #[must_use]
    pub fn is_live(&self, identity: IpAddr, now: Instant) -> bool {
        self.sessions
            .get(&identity)
            .is_some_and(|session| session.is_live(now, self.config.timeout))
    }

    /// Snapshot of the session for `identity`
    #[must_use]
    pub fn get(&self, identity: IpAddr, now: Instant) -> Option<SessionView> {
        self.sessions
            .get(&identity)
            .map(|session| session.view(now, self.config.timeout))
    }

    /// Snapshot of every session, sorted by identity
    #[must_use]
    pub fn list(&self, now: Instant) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self
            .sessions
            .iter()
            .map(|entry| entry.value().view(now, self.config.timeout))
            .collect();
        views.sort_by_key(|view| view.identity);
        views
    }

    /// Remove every session, live or not, returning the identities that held one
    pub fn drain(&self) -> Vec<IpAddr> {
        let identities: Vec<IpAddr> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let drained: Vec<IpAddr> = identities
            .into_iter()
            .filter(|identity| self.take(*identity).is_some())
            .collect();
        self.stats
            .revoked
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
