//! Error type for the wire codecs

use std::io;

use thiserror::Error;

/// Malformed or unsupported input on the DNS or HTTP boundary
#[derive(Debug, Error)]
pub enum WireError {
    /// Message shorter than the fixed header
    #[error("message too short: {len} bytes (minimum: {min})")]
    TooShort { len: usize, min: usize },

    /// QR bit set: the datagram is a response, not a query
    #[error("not a query (QR bit set)")]
    NotAQuery,

    /// Opcode other than standard query
    #[error("unsupported opcode: {0}")]
    UnsupportedOpcode(u8),

    /// Question count other than one
    #[error("unsupported question count: {0}")]
    QuestionCount(u16),

    /// Label length over 63 (this includes compression pointers)
    #[error("label at offset {offset} too long: {len}")]
    LabelTooLong { offset: usize, len: usize },

    /// Encoded name longer than 255 bytes
    #[error("domain name too long: {0} bytes")]
    NameTooLong(usize),

    /// Data ended inside the structure being parsed
    #[error("truncated at offset {offset}")]
    Truncated { offset: usize },

    /// HTTP start line or header block could not be parsed
    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),

    /// HTTP header block exceeded the configured limit
    #[error("HTTP header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    /// Declared body larger than the configured limit
    #[error("HTTP body of {len} bytes exceeds {limit} bytes")]
    BodyTooLarge { len: usize, limit: usize },

    /// Peer closed the stream before `Content-Length` bytes arrived
    #[error("HTTP body incomplete: expected {expected} bytes, received {received}")]
    IncompleteBody { expected: usize, received: usize },

    /// Peer closed the stream before sending anything
    #[error("connection closed before a request was received")]
    ConnectionClosed,

    /// Stream I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// HTTP status a gateway should answer with, if any
    ///
    /// `None` means the peer is gone and nothing should be written.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HeadersTooLarge { .. } => Some(431),
            Self::BodyTooLarge { .. } => Some(413),
            Self::ConnectionClosed | Self::Io(_) => None,
            _ => Some(400),
        }
    }
}

/// Result type for wire codec operations
pub type WireResult<T> = Result<T, WireError>;
