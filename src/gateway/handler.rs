//! Per-request routing for the portal
//!
//! | Request | Signed in | Response |
//! |---|---|---|
//! | `GET /`, `/login`, `/index.html`, `/status` | no | login page |
//! | same | yes | status page |
//! | `GET` other path | no | `302` to `/` |
//! | `GET` other path | yes | access granted page |
//! | `POST /login` | any | credentials checked; `302` to `/` with cookie, or `401` |
//! | `POST /logout` | any | session revoked, identity blocked, login page |
//! | anything else | any | `405` |

use std::net::IpAddr;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use super::pages::{self, Notice};
use crate::error::{LoginError, SessionError};
use crate::portal::Portal;
use crate::wire::{HttpRequest, HttpResponse, Method, StatusCode, WireError};

/// Paths that always show the portal itself
pub const PORTAL_PATHS: &[&str] = &["/", "/login", "/index.html", "/status"];

const INVALID_CREDENTIALS: &str = "Invalid username or password";
const ALREADY_SIGNED_IN: &str = "This device is already signed in";
const SIGNED_OUT: &str = "You have been signed out";

/// Routes requests for both the HTTP and HTTPS listeners
#[derive(Debug)]
pub struct GatewayHandler {
    portal: Arc<Portal>,
    cookie_name: String,
    cookie_max_age: u64,
}

impl GatewayHandler {
    #[must_use]
    pub fn new(portal: Arc<Portal>, cookie_name: impl Into<String>, cookie_max_age: u64) -> Self {
        Self {
            portal,
            cookie_name: cookie_name.into(),
            cookie_max_age,
        }
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Build the response for one request from `identity`
    ///
    /// `secure` marks requests that arrived over TLS; the session cookie is
    /// then flagged `Secure`.
    pub async fn handle(&self, request: &HttpRequest, identity: IpAddr, secure: bool) -> HttpResponse {
        debug!(
            identity = %identity,
            method = %request.method,
            path = %request.path,
            "Gateway request"
        );

        let response = match (&request.method, request.path.as_str()) {
            (Method::Post, "/login") => self.login(request, identity, secure).await,
            (Method::Post, "/logout") => self.logout(identity).await,
            (Method::Get | Method::Head, path) => self.page(request, identity, path).await,
            _ => HttpResponse::html(
                StatusCode::METHOD_NOT_ALLOWED,
                pages::error_page(405, StatusCode::METHOD_NOT_ALLOWED.reason()),
            )
            .with_header("Allow", "GET, HEAD, POST"),
        };

        response.no_store()
    }

    async fn page(&self, request: &HttpRequest, identity: IpAddr, path: &str) -> HttpResponse {
        let token = request.cookie(&self.cookie_name);
        let signed_in = self.portal.check(identity, token.as_deref()).await.is_ok();
        let portal_path = PORTAL_PATHS.contains(&path);

        match (portal_path, signed_in) {
            (true, true) => match self.portal.authority().get(identity, Instant::now()) {
                Some(view) => HttpResponse::html(StatusCode::OK, pages::status_page(&view)),
                // Revoked between the check and the lookup
                None => HttpResponse::html(StatusCode::OK, pages::login_page(None)),
            },
            (true, false) => HttpResponse::html(StatusCode::OK, pages::login_page(None)),
            (false, true) => HttpResponse::html(StatusCode::OK, pages::granted_page()),
            (false, false) => HttpResponse::redirect("/"),
        }
    }

    async fn login(&self, request: &HttpRequest, identity: IpAddr, secure: bool) -> HttpResponse {
        let form = request.form();
        let username = form.get("username").unwrap_or_default();
        let password = form.get("password").unwrap_or_default();

        match self.portal.login(identity, username, password).await {
            Ok(token) => HttpResponse::redirect("/")
                .with_header("Set-Cookie", self.session_cookie(token.as_str(), secure)),
            Err(LoginError::InvalidCredentials) => HttpResponse::html(
                StatusCode::UNAUTHORIZED,
                pages::login_page(Some(Notice::Error(INVALID_CREDENTIALS))),
            ),
            Err(LoginError::Session(SessionError::AlreadyAuthorized { .. })) => HttpResponse::html(
                StatusCode::FORBIDDEN,
                pages::login_page(Some(Notice::Error(ALREADY_SIGNED_IN))),
            ),
            Err(LoginError::Session(_)) => HttpResponse::html(
                StatusCode::UNAUTHORIZED,
                pages::login_page(Some(Notice::Error(INVALID_CREDENTIALS))),
            ),
        }
    }

    async fn logout(&self, identity: IpAddr) -> HttpResponse {
        self.portal.logout(identity).await;
        HttpResponse::html(StatusCode::OK, pages::login_page(Some(Notice::Info(SIGNED_OUT))))
            .with_header("Set-Cookie", self.cleared_cookie())
    }

    fn session_cookie(&self, token: &str, secure: bool) -> String {
        let mut cookie = format!(
            "{}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
            self.cookie_name, self.cookie_max_age
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    fn cleared_cookie(&self) -> String {
        format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", self.cookie_name)
    }
}

/// Response for a request that could not be framed
///
/// Returns `None` when the connection should just be closed.
#[must_use]
pub fn error_response(error: &WireError) -> Option<HttpResponse> {
    let status = StatusCode(error.http_status()?);
    Some(HttpResponse::html(status, pages::error_page(status.as_u16(), status.reason())).no_store())
}
