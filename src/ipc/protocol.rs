//! IPC Protocol definitions
//!
//! Command and response types exchanged over the control socket.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::dns::DnsStatsSnapshot;
use crate::gateway::GatewayStatsSnapshot;
use crate::portal::PortalStatus;
use crate::session::SessionView;

/// IPC command types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Ping to check if the server is alive
    Ping,

    /// Sessions, filter view and counters
    Status,

    /// Live sessions only
    ListSessions,

    /// Identities with an accept rule in the packet filter
    ListAllowed,

    /// Destroy a session and block its identity
    Revoke {
        identity: IpAddr,
    },

    /// Initiate the ordered shutdown
    Shutdown,
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Ping response
    Pong,

    /// Status response
    Status(StatusResponse),

    /// Session listing
    Sessions { sessions: Vec<SessionView> },

    /// Filter listing
    Allowed { identities: Vec<IpAddr> },

    /// Revocation outcome
    Revoked { identity: IpAddr, existed: bool },

    /// Generic success
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Error response
    Error(ErrorResponse),
}

impl IpcResponse {
    /// Create a success response with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success {
            message: Some(msg.into()),
        }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse {
            code,
            message: message.into(),
        })
    }

    /// Check if this is an error response
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Full status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub portal: PortalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsStatsSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<GatewayStatsSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<GatewayStatsSnapshot>,
}

/// Error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Error codes for IPC responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Invalid command
    InvalidCommand,
    /// Invalid parameters
    InvalidParameters,
    /// Packet filter could not be queried
    OperationFailed,
    /// Server is shutting down
    ShuttingDown,
}

/// Message framing for IPC
///
/// Messages are length-prefixed:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: JSON message
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MB
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with length prefix
///
/// # Errors
///
/// Returns the serializer error.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    #[allow(clippy::cast_possible_truncation)]
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a message body (without its length prefix)
///
/// # Errors
///
/// Returns the deserializer error.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}
