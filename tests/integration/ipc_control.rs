//! IPC control socket integration tests

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use captive_portal::config::IpcConfig;
use captive_portal::enforcer::{EnforcerCall, MemoryEnforcer};
use captive_portal::gateway::ServerOptions;
use captive_portal::ipc::{ErrorCode, IpcClient, IpcCommand, IpcHandler, IpcResponse, IpcServer};
use captive_portal::portal::Portal;
use captive_portal::session::AuthorityConfig;

use super::support::{get, login, portal, start_gateway, PASSWORD, USERNAME};

struct Control {
    client: IpcClient,
    portal: Arc<Portal>,
    enforcer: Arc<MemoryEnforcer>,
    shutdown_requests: mpsc::Receiver<()>,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    _dir: TempDir,
}

fn fixture() -> (Arc<Portal>, Arc<MemoryEnforcer>) {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    (portal, enforcer)
}

async fn start_control(
    portal: Arc<Portal>,
    enforcer: Arc<MemoryEnforcer>,
    handler: impl FnOnce(IpcHandler) -> IpcHandler,
) -> Control {
    let dir = tempfile::tempdir().unwrap();
    let config = IpcConfig {
        socket_path: dir.path().join("portal.sock"),
        socket_mode: 0o660,
        enabled: true,
        max_message_size: 64 * 1024,
    };

    let (shutdown_tx, shutdown_requests) = mpsc::channel(1);
    let ipc_handler = handler(IpcHandler::new(Arc::clone(&portal)).with_shutdown(shutdown_tx));
    let server = IpcServer::bind(&config, Arc::new(ipc_handler)).unwrap();

    let (stop, stop_rx) = oneshot::channel();
    let server = tokio::spawn(server.run_until_shutdown(stop_rx));

    Control {
        client: IpcClient::new(&config.socket_path),
        portal,
        enforcer,
        shutdown_requests,
        stop: Some(stop),
        server,
        _dir: dir,
    }
}

async fn start_plain() -> Control {
    let (portal, enforcer) = fixture();
    start_control(portal, enforcer, |h| h).await
}

// ============================================================================
// Status and Listings
// ============================================================================

#[tokio::test]
async fn test_status_reports_sessions_and_listener_counters() {
    let (portal, enforcer) = fixture();
    let gateway = start_gateway(Arc::clone(&portal), ServerOptions::default()).await;
    let stats = Arc::clone(gateway.server.stats());
    let control = start_control(portal, enforcer, move |h| h.with_gateway_stats(Some(stats), None)).await;

    let _ = login(gateway.addr).await;
    let _ = get(gateway.addr, "/", None).await;

    match control.client.send(IpcCommand::Status).await.unwrap() {
        IpcResponse::Status(status) => {
            assert_eq!(status.version, captive_portal::VERSION);
            assert_eq!(status.portal.sessions.len(), 1);
            assert_eq!(status.portal.sessions[0].principal, USERNAME);
            assert_eq!(status.portal.enforcer, "memory");
            let http = status.http.unwrap();
            assert_eq!(http.connections_accepted, 2);
            assert_eq!(http.requests_served, 2);
            assert!(status.https.is_none());
            assert!(status.dns.is_none());
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_list_sessions_and_allowed() {
    let control = start_plain().await;
    let a: IpAddr = "10.9.0.1".parse().unwrap();
    let b: IpAddr = "10.9.0.2".parse().unwrap();
    control.portal.login(a, USERNAME, PASSWORD).await.unwrap();
    control.portal.login(b, USERNAME, PASSWORD).await.unwrap();

    match control.client.send(IpcCommand::ListSessions).await.unwrap() {
        IpcResponse::Sessions { sessions } => {
            let mut identities: Vec<_> = sessions.iter().map(|s| s.identity).collect();
            identities.sort();
            assert_eq!(identities, vec![a, b]);
            assert!(sessions.iter().all(|s| s.principal == USERNAME));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    match control.client.send(IpcCommand::ListAllowed).await.unwrap() {
        IpcResponse::Allowed { identities } => assert_eq!(identities, vec![a, b]),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_list_allowed_reports_filter_failure() {
    let control = start_plain().await;
    control.enforcer.set_failing(true);

    match control.client.send(IpcCommand::ListAllowed).await.unwrap() {
        IpcResponse::Error(e) => assert_eq!(e.code, ErrorCode::OperationFailed),
        other => panic!("unexpected response: {other:?}"),
    }
}

// ============================================================================
// Revocation and Shutdown
// ============================================================================

#[tokio::test]
async fn test_revoke_blocks_identity() {
    let control = start_plain().await;
    let client: IpAddr = "10.9.0.3".parse().unwrap();
    let token = control.portal.login(client, USERNAME, PASSWORD).await.unwrap();

    match control.client.send(IpcCommand::Revoke { identity: client }).await.unwrap() {
        IpcResponse::Revoked { identity, existed } => {
            assert_eq!(identity, client);
            assert!(existed);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    assert_eq!(control.enforcer.count(EnforcerCall::Block(client)), 1);
    assert!(control.portal.check(client, Some(token.as_str())).await.is_err());

    // Revoking again is harmless and reports nothing to revoke
    match control.client.send(IpcCommand::Revoke { identity: client }).await.unwrap() {
        IpcResponse::Revoked { existed, .. } => assert!(!existed),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_command_signals_main_task() {
    let mut control = start_plain().await;

    let response = control.client.send(IpcCommand::Shutdown).await.unwrap();
    assert!(matches!(response, IpcResponse::Success { .. }));

    tokio::time::timeout(Duration::from_secs(1), control.shutdown_requests.recv())
        .await
        .unwrap()
        .unwrap();

    match control.client.send(IpcCommand::Status).await.unwrap() {
        IpcResponse::Error(e) => assert_eq!(e.code, ErrorCode::ShuttingDown),
        other => panic!("unexpected response: {other:?}"),
    }

    control.stop.take().unwrap().send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), control.server)
        .await
        .unwrap()
        .unwrap();
}
