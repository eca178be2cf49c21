//! Gateway HTTP integration tests
//!
//! Drives the login flow over real TCP connections. Every client connects
//! from 127.0.0.1, so that is the identity the portal sees.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use captive_portal::enforcer::EnforcerCall;
use captive_portal::error::PortalError;
use captive_portal::gateway::{GatewayHandler, GatewayServer, ServerOptions};
use captive_portal::session::AuthorityConfig;

use super::support::{exchange, get, login, portal, post, start_gateway, COOKIE};

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

// ============================================================================
// Login Flow
// ============================================================================

#[tokio::test]
async fn test_unauthenticated_requests_are_redirected() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let gateway = start_gateway(portal, ServerOptions::default()).await;

    let response = get(gateway.addr, "/generate_204", None).await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("Location"), Some("/"));

    let response = get(gateway.addr, "/", None).await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains("action=\"/login\""));
    assert_eq!(
        response.header("Cache-Control"),
        Some("no-cache, no-store, must-revalidate")
    );
    assert_eq!(response.header("Connection"), Some("close"));

    assert!(enforcer.calls().is_empty());
}

#[tokio::test]
async fn test_login_sets_cookie_and_grants_access() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let gateway = start_gateway(portal, ServerOptions::default()).await;

    let response = login(gateway.addr).await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("Location"), Some("/"));

    let cookie = response.header("Set-Cookie").unwrap();
    assert!(cookie.starts_with(&format!("{COOKIE}=")));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Max-Age=3600"));
    assert!(!cookie.contains("Secure"));

    let token = response.session_token().unwrap();
    assert_eq!(enforcer.count(EnforcerCall::Allow(loopback())), 1);

    let status = get(gateway.addr, "/", Some(&token)).await;
    assert_eq!(status.status, 200);
    assert!(status.body.contains("alice"));

    let elsewhere = get(gateway.addr, "/some/page", Some(&token)).await;
    assert_eq!(elsewhere.status, 200);
    assert!(elsewhere.body.contains("Internet access granted"));
}

#[tokio::test]
async fn test_wrong_password_is_generic_failure() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let gateway = start_gateway(portal, ServerOptions::default()).await;

    let bad_password = post(gateway.addr, "/login", "username=alice&password=nope", None).await;
    let bad_user = post(gateway.addr, "/login", "username=mallory&password=nope", None).await;

    assert_eq!(bad_password.status, 401);
    assert_eq!(bad_user.status, 401);
    assert_eq!(bad_password.body, bad_user.body);
    assert!(bad_password.body.contains("Invalid username or password"));
    assert!(bad_password.header("Set-Cookie").is_none());
    assert!(enforcer.calls().is_empty());
}

#[tokio::test]
async fn test_tampered_token_is_not_authorized() {
    let (portal, _, _) = portal(AuthorityConfig::default());
    let gateway = start_gateway(portal, ServerOptions::default()).await;

    let token = login(gateway.addr).await.session_token().unwrap();
    let mut tampered = token.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == 'A' { 'B' } else { 'A' });

    let response = get(gateway.addr, "/some/page", Some(&tampered)).await;
    assert_eq!(response.status, 302);

    // The genuine token still works
    let response = get(gateway.addr, "/some/page", Some(&token)).await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_logout_blocks_and_clears_cookie() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let gateway = start_gateway(portal.clone(), ServerOptions::default()).await;

    let token = login(gateway.addr).await.session_token().unwrap();
    let response = post(gateway.addr, "/logout", "", Some(&token)).await;

    assert_eq!(response.status, 200);
    assert!(response.header("Set-Cookie").unwrap().contains("Max-Age=0"));
    assert!(response.body.contains("signed out"));
    assert!(!enforcer.is_allowed(loopback()));
    assert!(portal.authority().is_empty());

    let response = get(gateway.addr, "/some/page", Some(&token)).await;
    assert_eq!(response.status, 302);
}

// ============================================================================
// Framing Errors
// ============================================================================

#[tokio::test]
async fn test_malformed_request_gets_error_page() {
    let (portal, _, _) = portal(AuthorityConfig::default());
    let gateway = start_gateway(portal, ServerOptions::default()).await;

    let response = exchange(gateway.addr, b"NOT-HTTP\r\n\r\n").await;
    assert_eq!(response.status, 400);
    assert!(!response.body.contains("NOT-HTTP"));

    // The listener is unaffected
    assert_eq!(get(gateway.addr, "/", None).await.status, 200);
}

#[tokio::test]
async fn test_unsupported_method_is_405() {
    let (portal, _, _) = portal(AuthorityConfig::default());
    let gateway = start_gateway(portal, ServerOptions::default()).await;

    let response = exchange(gateway.addr, b"DELETE / HTTP/1.1\r\nHost: portal.lan\r\n\r\n").await;
    assert_eq!(response.status, 405);
    assert_eq!(response.header("Allow"), Some("GET, HEAD, POST"));
}

#[tokio::test]
async fn test_stalled_client_times_out() {
    let (portal, _, _) = portal(AuthorityConfig::default());
    let options = ServerOptions {
        read_timeout: Duration::from_millis(100),
        ..ServerOptions::default()
    };
    let gateway = start_gateway(portal, options).await;

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: por").await.unwrap();

    let mut buf = Vec::new();
    let read = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf),
    )
    .await;
    assert!(read.is_ok(), "connection was not closed");
    assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 408"));
    assert_eq!(gateway.server.stats().snapshot().read_timeouts, 1);
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_bind_conflict_reverts_filter_baseline() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let handler = Arc::new(GatewayHandler::new(Arc::clone(&portal), COOKIE, 3600));
    let result = portal
        .start(GatewayServer::bind(addr, handler, ServerOptions::default()))
        .await;

    assert!(matches!(result, Err(PortalError::Bind { .. })));
    assert!(!enforcer.is_initialized());
    assert_eq!(
        enforcer.calls(),
        vec![EnforcerCall::Initialize, EnforcerCall::Teardown]
    );
}
