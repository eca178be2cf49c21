//! HTTP(S) listener
//!
//! One task per accepted connection, one request per connection. The
//! number of live connections is capped; once the cap is reached the accept
//! loop waits for a slot instead of spawning more tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, trace, warn};

#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

use super::handler::{error_response, GatewayHandler};
use super::pages;
use crate::error::PortalError;
use crate::wire::{read_request, write_response, HttpResponse, Method, RequestLimits, StatusCode, WireError};

/// Listener counters
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub connections_accepted: AtomicU64,
    pub requests_served: AtomicU64,
    pub malformed_requests: AtomicU64,
    pub read_timeouts: AtomicU64,
    pub tls_handshake_failures: AtomicU64,
    pub accept_errors: AtomicU64,
}

impl GatewayStats {
    #[must_use]
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            malformed_requests: self.malformed_requests.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
            tls_handshake_failures: self.tls_handshake_failures.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatsSnapshot {
    pub connections_accepted: u64,
    pub requests_served: u64,
    pub malformed_requests: u64,
    pub read_timeouts: u64,
    pub tls_handshake_failures: u64,
    pub accept_errors: u64,
}

/// Connection handling limits
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub max_connections: usize,
    /// Deadline for the TLS handshake plus the full request
    pub read_timeout: Duration,
    pub limits: RequestLimits,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 512,
            read_timeout: Duration::from_secs(10),
            limits: RequestLimits::default(),
        }
    }
}

/// Portal listener on one address, plain or TLS
pub struct GatewayServer {
    listener: TcpListener,
    handler: Arc<GatewayHandler>,
    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
    options: ServerOptions,
    connections: Arc<Semaphore>,
    stats: Arc<GatewayStats>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("local_addr", &self.local_addr)
            .field("secure", &self.is_secure())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl GatewayServer {
    /// Bind a plain HTTP listener
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Bind`] if the address cannot be acquired.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<GatewayHandler>,
        options: ServerOptions,
    ) -> Result<Self, PortalError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PortalError::bind("http", addr, &e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PortalError::bind("http", addr, &e))?;

        info!(addr = %local_addr, max_connections = options.max_connections, "Gateway listener bound");

        Ok(Self {
            listener,
            handler,
            #[cfg(feature = "tls")]
            tls: None,
            options,
            connections: Arc::new(Semaphore::new(options.max_connections.max(1))),
            stats: Arc::new(GatewayStats::default()),
            local_addr,
        })
    }

    /// Bind an HTTPS listener
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Bind`] if the address cannot be acquired.
    #[cfg(feature = "tls")]
    pub async fn bind_tls(
        addr: SocketAddr,
        handler: Arc<GatewayHandler>,
        options: ServerOptions,
        acceptor: TlsAcceptor,
    ) -> Result<Self, PortalError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PortalError::bind("https", addr, &e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PortalError::bind("https", addr, &e))?;

        info!(addr = %local_addr, max_connections = options.max_connections, "Gateway TLS listener bound");

        Ok(Self {
            listener,
            handler,
            tls: Some(acceptor),
            options,
            connections: Arc::new(Semaphore::new(options.max_connections.max(1))),
            stats: Arc::new(GatewayStats::default()),
            local_addr,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    #[cfg(feature = "tls")]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    #[cfg(not(feature = "tls"))]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        false
    }

    /// Connections currently being served
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.options.max_connections.max(1) - self.connections.available_permits()
    }

    /// Accept connections until `shutdown_rx` fires
    ///
    /// Connections already accepted keep running; see [`GatewayServer::drain`].
    pub async fn run_until_shutdown(&self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!(addr = %self.local_addr, secure = self.is_secure(), "Gateway listener starting");

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.connections).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = &mut shutdown_rx => {
                    info!(addr = %self.local_addr, "Gateway listener received shutdown signal");
                    break;
                }
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Gateway accept failed");
                        // Back off on descriptor exhaustion instead of spinning
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
                _ = &mut shutdown_rx => {
                    info!(addr = %self.local_addr, "Gateway listener received shutdown signal");
                    break;
                }
            };

            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
            trace!(peer = %peer, "Accepted connection");

            let handler = Arc::clone(&self.handler);
            let stats = Arc::clone(&self.stats);
            let options = self.options;
            #[cfg(feature = "tls")]
            let tls = self.tls.clone();

            tokio::spawn(async move {
                let _permit = permit;
                #[cfg(feature = "tls")]
                {
                    if let Some(acceptor) = tls {
                        serve_tls(acceptor, stream, peer, &handler, options, &stats).await;
                        return;
                    }
                }
                serve_connection(stream, peer, &handler, options, false, &stats).await;
            });
        }
    }

    /// Wait until every in-flight connection finishes, at most `timeout`
    ///
    /// Returns whether the listener drained completely.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let total = u32::try_from(self.options.max_connections.max(1)).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(timeout, self.connections.acquire_many(total)).await;
        match drained {
            Ok(Ok(_all)) => true,
            _ => {
                warn!(
                    addr = %self.local_addr,
                    in_flight = self.in_flight(),
                    "Gateway connections still open after drain timeout"
                );
                false
            }
        }
    }
}

#[cfg(feature = "tls")]
async fn serve_tls(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    handler: &GatewayHandler,
    options: ServerOptions,
    stats: &GatewayStats,
) {
    match tokio::time::timeout(options.read_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => {
            debug!(peer = %peer, "TLS handshake completed");
            serve_connection(tls_stream, peer, handler, options, true, stats).await;
        }
        Ok(Err(e)) => {
            stats.tls_handshake_failures.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer, error = %e, "TLS handshake failed");
        }
        Err(_) => {
            stats.tls_handshake_failures.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer, "TLS handshake timed out");
        }
    }
}

/// Frame one request, answer it and close
async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    handler: &GatewayHandler,
    options: ServerOptions,
    secure: bool,
    stats: &GatewayStats,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identity = peer.ip().to_canonical();

    let (response, head_only) =
        match tokio::time::timeout(options.read_timeout, read_request(&mut stream, &options.limits)).await {
            Ok(Ok(request)) => {
                let head_only = request.method == Method::Head;
                (handler.handle(&request, identity, secure).await, head_only)
            }
            Ok(Err(WireError::ConnectionClosed)) => return,
            Ok(Err(e)) => {
                stats.malformed_requests.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, error = %e, "Malformed request");
                match error_response(&e) {
                    Some(response) => (response, false),
                    None => return,
                }
            }
            Err(_) => {
                stats.read_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, "Request read timed out");
                let status = StatusCode::REQUEST_TIMEOUT;
                (
                    HttpResponse::html(status, pages::error_page(status.as_u16(), status.reason())).no_store(),
                    false,
                )
            }
        };

    if let Err(e) = write_response(&mut stream, &response, head_only).await {
        debug!(peer = %peer, error = %e, "Failed to write response");
        return;
    }
    stats.requests_served.fetch_add(1, Ordering::Relaxed);
    let _ = stream.shutdown().await;
}
