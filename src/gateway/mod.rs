//! Gateway Request Handler
//!
//! HTTP(S) front of the portal. Every client request ends up here, either
//! because DNS pointed the name at the gateway or because the client opened
//! the portal directly.
//!
//! # Architecture
//!
//! ```text
//!   TcpListener ── accept (bounded) ──▶ [TLS handshake] ──▶ read_request
//!                                                              │
//!                                   HttpResponse ◀── GatewayHandler::handle
//!                                                      │
//!                                              Portal (login / check / logout)
//! ```
//!
//! - [`GatewayServer`]: listener, connection cap, read deadline
//! - [`GatewayHandler`]: routing table and cookies
//! - [`pages`]: HTML

mod handler;
pub mod pages;
mod server;
#[cfg(feature = "tls")]
mod tls;

pub use handler::{error_response, GatewayHandler, PORTAL_PATHS};
pub use server::{GatewayServer, GatewayStats, GatewayStatsSnapshot, ServerOptions};
#[cfg(feature = "tls")]
pub use tls::create_tls_acceptor;

use crate::config::HttpConfig;

impl From<&HttpConfig> for ServerOptions {
    fn from(config: &HttpConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            read_timeout: config.read_timeout(),
            limits: config.request_limits(),
        }
    }
}
