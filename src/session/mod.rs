//! Session Authority
//!
//! Owns every authorized network identity, its token and its idle deadline.
//!
//! - [`SessionAuthority`]: create, authorize, revoke, sweep, list
//! - [`CorroboratorSource`]: link-layer address lookup (kernel ARP table)
//!
//! # Example
//!
//! ```
//! use captive_portal::session::{AuthorityConfig, SessionAuthority};
//! use tokio::time::Instant;
//!
//! let authority = SessionAuthority::new(AuthorityConfig::default());
//! let identity = "10.0.0.5".parse().unwrap();
//! let now = Instant::now();
//!
//! let created = authority.create(identity, None, "alice", now).unwrap();
//! let auth = authority.authorize(identity, created.token.as_str(), None, now).unwrap();
//! assert_eq!(auth.principal(), "alice");
//! assert!(authority.revoke(identity, now));
//! ```

mod authority;
mod corroborator;
mod types;

pub use authority::{
    Authorization, AuthorityConfig, AuthorityStats, AuthorityStatsSnapshot, Created,
    SessionAuthority,
};
pub use corroborator::{
    parse_arp_table, CorroboratorSource, ProcArpTable, StaticCorroborators, PROC_NET_ARP,
};
pub use types::{
    CorroborationMode, DuplicateLoginPolicy, MacAddr, ParseMacError, Session, SessionToken,
    SessionView, TOKEN_BYTES,
};
