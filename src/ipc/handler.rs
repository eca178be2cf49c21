//! IPC command handler
//!
//! This module processes IPC commands and generates responses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{ErrorCode, IpcCommand, IpcResponse, StatusResponse};
use crate::dns::DnsStats;
use crate::gateway::GatewayStats;
use crate::portal::Portal;

/// IPC command handler
pub struct IpcHandler {
    portal: Arc<Portal>,
    dns_stats: Option<Arc<DnsStats>>,
    http_stats: Option<Arc<GatewayStats>>,
    https_stats: Option<Arc<GatewayStats>>,
    /// Asks the main task to begin the ordered shutdown
    shutdown_tx: Option<mpsc::Sender<()>>,
    shutting_down: AtomicBool,
    version: String,
}

impl std::fmt::Debug for IpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHandler")
            .field("version", &self.version)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

impl IpcHandler {
    /// Create a new IPC handler
    #[must_use]
    pub fn new(portal: Arc<Portal>) -> Self {
        Self {
            portal,
            dns_stats: None,
            http_stats: None,
            https_stats: None,
            shutdown_tx: None,
            shutting_down: AtomicBool::new(false),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Include DNS counters in status reports
    #[must_use]
    pub fn with_dns_stats(mut self, stats: Arc<DnsStats>) -> Self {
        self.dns_stats = Some(stats);
        self
    }

    /// Include listener counters in status reports
    #[must_use]
    pub fn with_gateway_stats(
        mut self,
        http: Option<Arc<GatewayStats>>,
        https: Option<Arc<GatewayStats>>,
    ) -> Self {
        self.http_stats = http;
        self.https_stats = https;
        self
    }

    /// Channel signalled by the `shutdown` command
    #[must_use]
    pub fn with_shutdown(mut self, shutdown_tx: mpsc::Sender<()>) -> Self {
        self.shutdown_tx = Some(shutdown_tx);
        self
    }

    /// Handle an IPC command and return a response
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        debug!("Handling IPC command: {:?}", command);

        if self.shutting_down.load(Ordering::SeqCst) && !matches!(command, IpcCommand::Ping) {
            return IpcResponse::error(ErrorCode::ShuttingDown, "Portal is shutting down");
        }

        match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::Status => self.handle_status().await,

            IpcCommand::ListSessions => IpcResponse::Sessions {
                sessions: self.portal.authority().list(tokio::time::Instant::now()),
            },

            IpcCommand::ListAllowed => self.handle_list_allowed().await,

            IpcCommand::Revoke { identity } => {
                let existed = self.portal.revoke(identity).await;
                IpcResponse::Revoked { identity, existed }
            }

            IpcCommand::Shutdown => self.handle_shutdown(),
        }
    }

    async fn handle_status(&self) -> IpcResponse {
        IpcResponse::Status(StatusResponse {
            version: self.version.clone(),
            portal: self.portal.status().await,
            dns: self.dns_stats.as_ref().map(|s| s.snapshot()),
            http: self.http_stats.as_ref().map(|s| s.snapshot()),
            https: self.https_stats.as_ref().map(|s| s.snapshot()),
        })
    }

    async fn handle_list_allowed(&self) -> IpcResponse {
        match self.portal.status().await.allowed {
            Some(identities) => IpcResponse::Allowed { identities },
            None => IpcResponse::error(
                ErrorCode::OperationFailed,
                "Failed to list packet filter accept rules",
            ),
        }
    }

    fn handle_shutdown(&self) -> IpcResponse {
        info!("Shutdown requested over IPC");
        self.shutting_down.store(true, Ordering::SeqCst);

        match &self.shutdown_tx {
            Some(tx) => {
                // A full channel means a shutdown request is already pending
                if let Err(mpsc::error::TrySendError::Closed(())) = tx.try_send(()) {
                    warn!("Shutdown receiver already gone");
                }
                IpcResponse::success_with_message("Shutdown initiated")
            }
            None => IpcResponse::error(
                ErrorCode::InvalidCommand,
                "Shutdown is not available on this instance",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::enforcer::{EnforcerCall, MemoryEnforcer};
    use crate::session::{AuthorityConfig, SessionAuthority, StaticCorroborators};

    fn setup() -> (Arc<Portal>, Arc<MemoryEnforcer>) {
        let enforcer = Arc::new(MemoryEnforcer::new());
        let portal = Arc::new(Portal::new(
            SessionAuthority::new(AuthorityConfig::default()),
            enforcer.clone(),
            Arc::new(StaticCredentials::new([("alice", "pw")])),
            Arc::new(StaticCorroborators::new()),
        ));
        (portal, enforcer)
    }

    #[tokio::test]
    async fn test_ping_and_status() {
        let (portal, _) = setup();
        portal.login("10.0.0.5".parse().unwrap(), "alice", "pw").await.unwrap();
        let handler = IpcHandler::new(portal).with_dns_stats(Arc::new(DnsStats::default()));

        assert!(matches!(handler.handle(IpcCommand::Ping).await, IpcResponse::Pong));

        match handler.handle(IpcCommand::Status).await {
            IpcResponse::Status(status) => {
                assert_eq!(status.portal.sessions.len(), 1);
                assert!(status.dns.is_some());
                assert!(status.http.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_and_revoke() {
        let (portal, enforcer) = setup();
        let client = "10.0.0.5".parse().unwrap();
        portal.login(client, "alice", "pw").await.unwrap();
        let handler = IpcHandler::new(portal);

        match handler.handle(IpcCommand::ListAllowed).await {
            IpcResponse::Allowed { identities } => assert_eq!(identities, vec![client]),
            other => panic!("unexpected response: {other:?}"),
        }

        match handler.handle(IpcCommand::Revoke { identity: client }).await {
            IpcResponse::Revoked { existed, .. } => assert!(existed),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(enforcer.count(EnforcerCall::Block(client)), 1);

        match handler.handle(IpcCommand::ListSessions).await {
            IpcResponse::Sessions { sessions } => assert!(sessions.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_of_expired_session_reports_not_existed() {
        let (portal, enforcer) = setup();
        let client = "10.0.0.6".parse().unwrap();
        portal.login(client, "alice", "pw").await.unwrap();
        let handler = IpcHandler::new(portal);

        // Past the idle timeout but before any sweep
        tokio::time::advance(std::time::Duration::from_secs(61 * 60)).await;

        match handler.handle(IpcCommand::Revoke { identity: client }).await {
            IpcResponse::Revoked { identity, existed } => {
                assert_eq!(identity, client);
                assert!(!existed);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(enforcer.count(EnforcerCall::Block(client)), 1);
        assert!(!enforcer.is_allowed(client));
    }

    #[tokio::test]
    async fn test_shutdown_signals_once() {
        let (portal, _) = setup();
        let (tx, mut rx) = mpsc::channel(1);
        let handler = IpcHandler::new(portal).with_shutdown(tx);

        let response = handler.handle(IpcCommand::Shutdown).await;
        assert!(!response.is_error());
        assert!(rx.recv().await.is_some());

        // Further commands are refused, ping still answers
        assert!(handler.handle(IpcCommand::Status).await.is_error());
        assert!(matches!(handler.handle(IpcCommand::Ping).await, IpcResponse::Pong));
    }

    #[tokio::test]
    async fn test_shutdown_without_channel() {
        let (portal, _) = setup();
        let handler = IpcHandler::new(portal);
        assert!(handler.handle(IpcCommand::Shutdown).await.is_error());
    }
}
