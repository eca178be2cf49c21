//! Wire codecs for the two protocols the gateway speaks at its boundary
//!
//! - [`dns`]: a deliberately minimal DNS codec. It validates just enough of a
//!   query to echo its question section and appends a single `A` record
//!   pointing at the gateway.
//! - [`http`]: HTTP/1.x request framing over a raw byte stream and response
//!   serialization.
//! - [`form`]: `application/x-www-form-urlencoded` bodies and `Cookie` headers.
//!
//! Both codecs report malformed input as [`WireError`]; callers drop the
//! datagram (DNS) or answer `400` (HTTP), never crash.

pub mod dns;
mod error;
pub mod form;
pub mod http;

pub use dns::{answer_for, build_answer, DnsQuery, DEFAULT_ANSWER_TTL, DNS_HEADER_SIZE, MAX_LABEL_LENGTH};
pub use error::{WireError, WireResult};
pub use form::{parse_cookies, FormData};
pub use http::{
    read_request, write_response, HttpRequest, HttpResponse, Method, RequestLimits, StatusCode,
};
