//! Shared fixtures for the integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use captive_portal::auth::StaticCredentials;
use captive_portal::enforcer::MemoryEnforcer;
use captive_portal::gateway::{GatewayHandler, GatewayServer, ServerOptions};
use captive_portal::portal::Portal;
use captive_portal::session::{AuthorityConfig, SessionAuthority, StaticCorroborators};

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "wonderland";
pub const COOKIE: &str = "portal_session";

pub type Fixture = (Arc<Portal>, Arc<MemoryEnforcer>, Arc<StaticCorroborators>);

/// Portal over an in-memory filter with a single known user
pub fn portal(config: AuthorityConfig) -> Fixture {
    portal_with_users(config, &[(USERNAME, PASSWORD)])
}

pub fn portal_with_users(config: AuthorityConfig, users: &[(&str, &str)]) -> Fixture {
    let enforcer = Arc::new(MemoryEnforcer::new());
    let corroborators = Arc::new(StaticCorroborators::new());
    let portal = Arc::new(Portal::new(
        SessionAuthority::new(config),
        enforcer.clone(),
        Arc::new(StaticCredentials::new(users.iter().copied())),
        corroborators.clone(),
    ));
    (portal, enforcer, corroborators)
}

/// Running plain-HTTP gateway
pub struct Gateway {
    pub server: Arc<GatewayServer>,
    pub addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

pub async fn start_gateway(portal: Arc<Portal>, options: ServerOptions) -> Gateway {
    let handler = Arc::new(GatewayHandler::new(portal, COOKIE, 3600));
    let server = Arc::new(
        GatewayServer::bind("127.0.0.1:0".parse().unwrap(), handler, options)
            .await
            .unwrap(),
    );
    let addr = server.local_addr();
    let (tx, rx) = oneshot::channel();
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run_until_shutdown(rx).await });
    Gateway {
        server,
        addr,
        _shutdown: tx,
    }
}

/// Parsed response as seen by a client
#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Token from a `Set-Cookie` header for the session cookie
    pub fn session_token(&self) -> Option<String> {
        let cookie = self.header("Set-Cookie")?;
        let value = cookie.strip_prefix(&format!("{COOKIE}="))?;
        let token = value.split(';').next()?;
        (!token.is_empty()).then(|| token.to_string())
    }
}

/// Send raw bytes and read until the server closes the connection
pub async fn exchange(addr: SocketAddr, raw: &[u8]) -> ClientResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap();

    parse_response(&String::from_utf8_lossy(&buf))
}

pub async fn get(addr: SocketAddr, path: &str, token: Option<&str>) -> ClientResponse {
    let cookie = token
        .map(|t| format!("Cookie: {COOKIE}={t}\r\n"))
        .unwrap_or_default();
    let raw = format!("GET {path} HTTP/1.1\r\nHost: portal.lan\r\n{cookie}\r\n");
    exchange(addr, raw.as_bytes()).await
}

pub async fn post(addr: SocketAddr, path: &str, body: &str, token: Option<&str>) -> ClientResponse {
    let cookie = token
        .map(|t| format!("Cookie: {COOKIE}={t}\r\n"))
        .unwrap_or_default();
    let raw = format!(
        "POST {path} HTTP/1.1\r\nHost: portal.lan\r\n{cookie}\
         Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    exchange(addr, raw.as_bytes()).await
}

pub async fn login(addr: SocketAddr) -> ClientResponse {
    post(addr, "/login", &format!("username={USERNAME}&password={PASSWORD}"), None).await
}

fn parse_response(text: &str) -> ClientResponse {
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text, ""));
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();
    ClientResponse {
        status,
        headers,
        body: body.to_string(),
    }
}
