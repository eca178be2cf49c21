//! DNS interception for the captive portal
//!
//! Every name resolves to the gateway, so that an unauthenticated client's
//! browser lands on the login page whatever URL it tries first.
//!
//! # Architecture
//!
//! ```text
//! Client Query
//!     │
//!     ▼
//! ┌─────────────────┐
//! │ In-flight limit │ ─── Full ──▶ dropped (warn)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Query parser   │ ─── Malformed / non-query ──▶ no response
//! └────────┬────────┘
//!          │
//!          ▼
//!   A record = gateway_ip, question echoed
//! ```
//!
//! There is no cache, upstream or recursion: answers are a pure function of
//! the query bytes and the configured address.
//!
//! # Example
//!
//! ```no_run
//! use captive_portal::dns::DnsInterceptor;
//! use std::net::Ipv4Addr;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dns = DnsInterceptor::bind("0.0.0.0:53".parse()?, Ipv4Addr::new(192, 168, 4, 1), 60, 256).await?;
//! let (_tx, rx) = tokio::sync::oneshot::channel();
//! dns.run_until_shutdown(rx).await;
//! # Ok(())
//! # }
//! ```

mod interceptor;

pub use interceptor::{DnsInterceptor, DnsStats, DnsStatsSnapshot};
