//! UDP DNS interceptor
//!
//! Answers every well-formed standard query with the gateway address.
//! Each datagram is handled on its own task; the number of tasks in flight
//! is capped by a semaphore and datagrams arriving while the cap is reached
//! are dropped, never queued.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::config::DnsConfig;
use crate::error::PortalError;
use crate::wire::{build_answer, DnsQuery};

/// Largest datagram read; longer queries are truncated and fail to parse
const RECV_BUFFER_SIZE: usize = 4096;

/// Overload warnings are emitted for the first drop and then once per this many
const DROP_LOG_EVERY: u64 = 100;

/// Interceptor counters
#[derive(Debug, Default)]
pub struct DnsStats {
    pub queries_received: AtomicU64,
    pub answers_sent: AtomicU64,
    pub malformed: AtomicU64,
    pub dropped_overload: AtomicU64,
    pub send_errors: AtomicU64,
}

impl DnsStats {
    #[must_use]
    pub fn snapshot(&self) -> DnsStatsSnapshot {
        DnsStatsSnapshot {
            queries_received: self.queries_received.load(Ordering::Relaxed),
            answers_sent: self.answers_sent.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped_overload: self.dropped_overload.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DnsStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsStatsSnapshot {
    pub queries_received: u64,
    pub answers_sent: u64,
    pub malformed: u64,
    pub dropped_overload: u64,
    pub send_errors: u64,
}

/// DNS server that resolves every name to the gateway
#[derive(Debug)]
pub struct DnsInterceptor {
    socket: Arc<UdpSocket>,
    gateway_ip: Ipv4Addr,
    ttl: u32,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    stats: Arc<DnsStats>,
    local_addr: SocketAddr,
}

impl DnsInterceptor {
    /// Bind the interceptor
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Bind`] if the socket cannot be acquired.
    pub async fn bind(
        addr: SocketAddr,
        gateway_ip: Ipv4Addr,
        ttl: u32,
        max_in_flight: usize,
    ) -> Result<Self, PortalError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| PortalError::bind("dns", addr, &e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| PortalError::bind("dns", addr, &e))?;

        info!(addr = %local_addr, gateway_ip = %gateway_ip, ttl, max_in_flight, "DNS interceptor bound");

        let max_in_flight = max_in_flight.max(1);
        Ok(Self {
            socket: Arc::new(socket),
            gateway_ip,
            ttl,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            stats: Arc::new(DnsStats::default()),
            local_addr,
        })
    }

    /// Bind using the `dns` configuration section
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Bind`] if the socket cannot be acquired.
    pub async fn from_config(config: &DnsConfig, gateway_ip: Ipv4Addr) -> Result<Self, PortalError> {
        Self::bind(config.listen, gateway_ip, config.answer_ttl_secs, config.max_in_flight).await
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<DnsStats> {
        &self.stats
    }

    /// Receive and answer queries until `shutdown_rx` fires
    pub async fn run_until_shutdown(&self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!(addr = %self.local_addr, "DNS interceptor starting");
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.dispatch(Bytes::copy_from_slice(&buf[..len]), src),
                        Err(e) => debug!(error = %e, "DNS recv_from failed"),
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("DNS interceptor received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Wait for in-flight answers to finish, at most `timeout`
    pub async fn drain(&self, timeout: Duration) -> bool {
        let total = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(timeout, self.permits.acquire_many(total)).await,
            Ok(Ok(_))
        )
    }

    fn dispatch(&self, datagram: Bytes, src: SocketAddr) {
        self.stats.queries_received.fetch_add(1, Ordering::Relaxed);

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            let dropped = self.stats.dropped_overload.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                warn!(src = %src, dropped, "DNS concurrency limit reached, dropping query");
            } else {
                debug!(src = %src, "Dropping DNS query under load");
            }
            return;
        };

        let socket = Arc::clone(&self.socket);
        let stats = Arc::clone(&self.stats);
        let gateway_ip = self.gateway_ip;
        let ttl = self.ttl;

        tokio::spawn(async move {
            let _permit = permit;

            let query = match DnsQuery::parse(&datagram) {
                Ok(query) => query,
                Err(e) => {
                    stats.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(src = %src, len = datagram.len(), error = %e, "Ignoring DNS datagram");
                    return;
                }
            };

            trace!(
                src = %src,
                id = query.transaction_id(),
                name = query.requested_name(),
                qtype = query.question_type(),
                "DNS query"
            );
            let answer = build_answer(&query, gateway_ip, ttl);

            match socket.send_to(&answer, src).await {
                Ok(_) => {
                    stats.answers_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(dst = %src, error = %e, "Failed to send DNS answer");
                }
            }
        });
    }
}
