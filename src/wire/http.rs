//! HTTP/1.x request framing and response serialization
//!
//! Requests are framed directly off a byte stream: the head is accumulated
//! until `httparse` reports it complete, then exactly `Content-Length` body
//! bytes are read. Only one request is read per connection; every response
//! is written with `Connection: close`.
//!
//! ## Request Format
//!
//! ```text
//! Method SP Request-Target SP HTTP-Version CRLF
//! Header-Field CRLF
//! ...
//! CRLF
//! [ Message-Body ]
//! ```
//!
//! Chunked bodies are not supported and are answered with `400`, as are
//! conflicting or unparsable `Content-Length` headers.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::error::{WireError, WireResult};
use super::form::{parse_cookies, FormData};

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 64;

/// Initial read buffer capacity
const READ_CHUNK: usize = 4096;

/// Size limits applied while framing a request
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    /// Largest accepted request head (start line + headers)
    pub max_header_bytes: usize,
    /// Largest accepted `Content-Length`
    pub max_body_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 8192,
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Request method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    /// Any other token, kept for logging and `405` responses
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            other => Self::Other(other.to_string()),
        }
    }

    /// Method name as it appears on the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully framed request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Request target exactly as sent
    pub target: String,
    /// Path component of the target, `/` if empty
    pub path: String,
    /// Query string without the leading `?`
    pub query: Option<String>,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    /// First header with the given name, compared case-insensitively
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of a named cookie across all `Cookie` headers
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, v)| parse_cookies(v))
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Decode the body as `application/x-www-form-urlencoded`
    #[must_use]
    pub fn form(&self) -> FormData {
        FormData::parse(&self.body)
    }

    /// `Host` header without port
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        let host = self.header("host")?;
        if host.starts_with('[') {
            // IPv6 literal
            return host.split_once(']').map(|(h, _)| &h[1..]);
        }
        Some(host.split(':').next().unwrap_or(host))
    }
}

/// Read and frame exactly one request from `reader`
///
/// # Errors
///
/// - [`WireError::ConnectionClosed`] if the peer closed before sending a byte
/// - [`WireError::HeadersTooLarge`] if the head exceeds the limit
/// - [`WireError::BodyTooLarge`] if `Content-Length` exceeds the limit
/// - [`WireError::IncompleteBody`] if the stream ended inside the body
/// - [`WireError::MalformedRequest`] for anything `httparse` rejects, chunked
///   bodies, and invalid `Content-Length` values
pub async fn read_request<R>(reader: &mut R, limits: &RequestLimits) -> WireResult<HttpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK.min(limits.max_header_bytes.max(1)));

    let (head_len, mut request) = loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(WireError::ConnectionClosed);
            }
            return Err(WireError::MalformedRequest(
                "stream ended inside request head".into(),
            ));
        }

        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }

        if buf.len() >= limits.max_header_bytes {
            return Err(WireError::HeadersTooLarge {
                limit: limits.max_header_bytes,
            });
        }
    };

    if head_len > limits.max_header_bytes {
        return Err(WireError::HeadersTooLarge {
            limit: limits.max_header_bytes,
        });
    }

    if request
        .headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("transfer-encoding"))
    {
        return Err(WireError::MalformedRequest(
            "transfer-encoding is not supported".into(),
        ));
    }

    let content_length = content_length(&request.headers)?;
    if content_length > limits.max_body_bytes {
        return Err(WireError::BodyTooLarge {
            len: content_length,
            limit: limits.max_body_bytes,
        });
    }

    let mut body = buf.split_off(head_len);
    while body.len() < content_length {
        let n = reader.read_buf(&mut body).await?;
        if n == 0 {
            return Err(WireError::IncompleteBody {
                expected: content_length,
                received: body.len(),
            });
        }
    }
    // Anything past Content-Length is ignored
    body.truncate(content_length);
    request.body = body.freeze();

    trace!(
        method = %request.method,
        path = %request.path,
        body_len = request.body.len(),
        "Framed HTTP request"
    );

    Ok(request)
}

/// Try to parse a complete head out of `data`
///
/// Returns `Ok(None)` while more bytes are needed.
fn parse_head(data: &[u8]) -> WireResult<Option<(usize, HttpRequest)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(WireError::MalformedRequest(e.to_string())),
    };

    let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version) else {
        return Err(WireError::MalformedRequest("incomplete start line".into()));
    };

    let mut parsed_headers = Vec::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value).map_err(|_| {
            WireError::MalformedRequest(format!("non UTF-8 value in header {}", header.name))
        })?;
        parsed_headers.push((header.name.to_string(), value.trim().to_string()));
    }

    let (path, query) = split_target(target);

    Ok(Some((
        head_len,
        HttpRequest {
            method: Method::from_token(method),
            target: target.to_string(),
            path,
            query,
            version,
            headers: parsed_headers,
            body: Bytes::new(),
        },
    )))
}

/// Split a request target into path and query
///
/// Absolute-form targets (`http://host/path`) are reduced to their path.
fn split_target(target: &str) -> (String, Option<String>) {
    let origin = ["http://", "https://"]
        .iter()
        .find_map(|scheme| target.strip_prefix(scheme))
        .map_or(target, |rest| rest.find('/').map_or("/", |i| &rest[i..]));

    let (path, query) = match origin.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (origin, None),
    };

    let path = if path.is_empty() { "/" } else { path };
    (path.to_string(), query)
}

/// Resolve the body length from `Content-Length` headers
///
/// Repeated headers are accepted only when they agree.
fn content_length(headers: &[(String, String)]) -> WireResult<usize> {
    let mut length: Option<usize> = None;

    for (_, value) in headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    {
        let parsed = value
            .parse::<usize>()
            .map_err(|_| WireError::MalformedRequest(format!("invalid content-length: {value}")))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(WireError::MalformedRequest(
                    "conflicting content-length headers".into(),
                ));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(length.unwrap_or(0))
}

// ============================================================================
// Responses
// ============================================================================

/// Response status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: Self = Self(200);
    pub const FOUND: Self = Self(302);
    pub const BAD_REQUEST: Self = Self(400);
    pub const UNAUTHORIZED: Self = Self(401);
    pub const FORBIDDEN: Self = Self(403);
    pub const NOT_FOUND: Self = Self(404);
    pub const METHOD_NOT_ALLOWED: Self = Self(405);
    pub const REQUEST_TIMEOUT: Self = Self(408);
    pub const PAYLOAD_TOO_LARGE: Self = Self(413);
    pub const HEADER_FIELDS_TOO_LARGE: Self = Self(431);
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    pub const SERVICE_UNAVAILABLE: Self = Self(503);

    /// Numeric code
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Canonical reason phrase
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            302 => "Found",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

/// A response ready to be serialized
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Empty response with the given status
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// HTML page
    #[must_use]
    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(body.into())
    }

    /// Plain text body
    #[must_use]
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    /// `302 Found` pointing at `location`
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        Self::new(StatusCode::FOUND).with_header("Location", location)
    }

    /// Append a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add headers that forbid any caching of the response
    #[must_use]
    pub fn no_store(self) -> Self {
        self.with_header("Cache-Control", "no-cache, no-store, must-revalidate")
            .with_header("Pragma", "no-cache")
            .with_header("Expires", "0")
    }

    /// First header with the given name, compared case-insensitively
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize as HTTP/1.1
    ///
    /// `Content-Length` always reflects the body; with `head_only` the body
    /// itself is omitted.
    #[must_use]
    pub fn to_bytes(&self, head_only: bool) -> Bytes {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        if self.header("connection").is_none() {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        let mut out = BytesMut::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        if !head_only {
            out.extend_from_slice(&self.body);
        }
        out.freeze()
    }
}

/// Write `response` to `writer` and flush
///
/// # Errors
///
/// Returns an I/O error if the peer has gone away.
pub async fn write_response<W>(
    writer: &mut W,
    response: &HttpResponse,
    head_only: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.to_bytes(head_only)).await?;
    writer.flush().await
}
