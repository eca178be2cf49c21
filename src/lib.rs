//! captive-portal: Captive portal gateway for Linux
//!
//! Intercepts DNS so every name resolves to the gateway, serves a login page
//! on HTTP(S), and grants or revokes per-client forwarding in the packet
//! filter as sessions begin and end.
//!
//! # Architecture
//!
//! ```text
//! Client DNS  → DnsInterceptor ──→ gateway_ip
//! Client HTTP → GatewayServer → GatewayHandler → Portal → SessionAuthority
//!                                                  ↓
//!                                           FilterEnforcer (iptables)
//! Sweeper ─────────────────────────────────→ Portal::sweep
//! IpcServer ───────────────────────────────→ Portal (status, revoke)
//! ```
//!
//! The [`session::SessionAuthority`] is the single source of truth; the
//! packet filter is reconciled towards it after every transition.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use captive_portal::auth::UserStore;
//! use captive_portal::config::load_config;
//! use captive_portal::enforcer::build_enforcer;
//! use captive_portal::portal::Portal;
//! use captive_portal::session::{ProcArpTable, SessionAuthority};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/captive-portal/config.json")?;
//!
//! let portal = Arc::new(Portal::new(
//!     SessionAuthority::new(config.session.authority_config()),
//!     build_enforcer(&config.firewall),
//!     Arc::new(UserStore::load(&config.users_file)?),
//!     Arc::new(ProcArpTable::new()),
//! ));
//! portal.initialize().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`auth`]: Credential validation and the user store
//! - [`config`]: Configuration types and loading
//! - [`dns`]: DNS interceptor
//! - [`enforcer`]: Packet-filter backends
//! - [`error`]: Error types
//! - [`gateway`]: HTTP(S) login portal
//! - [`ipc`]: IPC server and protocol
//! - [`portal`]: Session/filter coordination and the expiry sweeper
//! - [`session`]: Session authority
//! - [`wire`]: DNS and HTTP/1.1 codecs

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod auth;
pub mod config;
pub mod dns;
pub mod enforcer;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod portal;
pub mod session;
pub mod wire;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{
    AuthError, ConfigError, EnforcementError, IpcError, LoginError, PortalError, Result,
    SessionError,
};
pub use portal::Portal;
pub use session::SessionAuthority;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Whether the process runs with effective uid 0
///
/// Reads `/proc/self/status`; anything unreadable counts as unprivileged.
pub fn is_root() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|status| effective_uid(&status) == Some(0))
        .unwrap_or(false)
}

/// Effective uid from the `Uid:` line (real, effective, saved, fs)
fn effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().nth(1))
        .and_then(|euid| euid.parse().ok())
}
