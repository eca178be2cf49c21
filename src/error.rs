//! Error types for captive-portal
//!
//! This module defines the error hierarchy for the gateway. Errors are
//! grouped by subsystem and carry a recoverability hint so that callers
//! can tell per-request failures (isolated, logged) from startup failures
//! (fatal).

use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::wire::WireError;

/// Top-level error type for captive-portal
#[derive(Debug, Error)]
pub enum PortalError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A listening socket could not be acquired
    #[error("Failed to bind {service} listener on {addr}: {reason} (binding ports below 1024 requires root or CAP_NET_BIND_SERVICE)")]
    Bind {
        service: &'static str,
        addr: SocketAddr,
        reason: String,
    },

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed DNS or HTTP input
    #[error("Malformed input: {0}")]
    Wire(#[from] WireError),

    /// Session authority errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Packet filter errors
    #[error("Enforcement error: {0}")]
    Enforcement(#[from] EnforcementError),

    /// Credential store errors
    #[error("Credential store error: {0}")]
    Auth(#[from] AuthError),

    /// IPC communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PortalError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Bind { .. } | Self::Tls(_) | Self::Auth(_) => false,
            Self::Wire(_) | Self::Session(_) => true,
            Self::Enforcement(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a bind error from the underlying socket error
    pub fn bind(service: &'static str, addr: SocketAddr, source: &io::Error) -> Self {
        Self::Bind {
            service,
            addr,
            reason: source.to_string(),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Session authority errors
///
/// None of these are fatal: they translate into "serve the login page" or
/// "deny" at the request boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session matches the presented identity and token
    #[error("No authorized session for {identity}")]
    Unauthenticated { identity: IpAddr },

    /// The session existed but its idle timeout elapsed
    #[error("Session for {identity} expired")]
    Expired { identity: IpAddr },

    /// The token or link-layer address does not belong to this identity
    #[error("Identity mismatch: request from {identity} for session held by {session_identity}")]
    IdentityMismatch {
        identity: IpAddr,
        session_identity: IpAddr,
    },

    /// A live session already exists and the duplicate-login policy rejects re-login
    #[error("Identity {identity} is already authorized")]
    AlreadyAuthorized { identity: IpAddr },
}

impl SessionError {
    /// Whether this error should be logged as a possible spoofing attempt
    #[must_use]
    pub const fn is_security_relevant(&self) -> bool {
        matches!(self, Self::IdentityMismatch { .. })
    }
}

/// Login failures surfaced to the client
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoginError {
    /// Username or password wrong; deliberately does not say which
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The authority refused to create the session
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Packet filter enforcement errors
#[derive(Debug, Error)]
pub enum EnforcementError {
    /// The filter tool could not be started
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The filter tool ran and exited unsuccessfully
    #[error("Command `{command}` failed (exit {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The filter tool did not finish in time
    #[error("Command `{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// One or more sub-steps of a compound operation failed
    #[error("{operation} for {target}: {failed} of {attempted} steps failed")]
    Partial {
        operation: &'static str,
        target: String,
        failed: usize,
        attempted: usize,
    },
}

impl EnforcementError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Spawn { .. } => false,
            Self::CommandFailed { .. } | Self::Timeout { .. } | Self::Partial { .. } => true,
        }
    }

    /// Create a command failure error
    pub fn command_failed(
        command: impl Into<String>,
        status: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }
}

/// Credential store errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// User file could not be parsed
    #[error("Failed to parse user store {path}: {reason}")]
    ParseError { path: String, reason: String },

    /// Stored hash is malformed
    #[error("Malformed password hash for user {username}")]
    MalformedHash { username: String },

    /// Username already present in the store
    #[error("User {username} already exists")]
    UserExists { username: String },

    /// Username absent from the store
    #[error("User {username} does not exist")]
    UnknownUser { username: String },

    /// Username empty or containing whitespace or control characters
    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),

    /// Failed to serialize the user store
    #[error("Failed to serialize user store: {0}")]
    SerializeError(String),

    /// I/O error while reading or writing the user store
    #[error("I/O error on user store: {0}")]
    IoError(#[from] io::Error),
}

/// IPC communication errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to create Unix socket
    #[error("Failed to create IPC socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    /// Failed to bind Unix socket
    #[error("Failed to bind IPC socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    /// Connection error
    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    /// Protocol error (invalid message format)
    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("IPC serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("IPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation { .. } | Self::BindError { .. } | Self::SerializationError(_) => {
                false
            }
            Self::ConnectionError(_) | Self::ProtocolError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Type alias for Result with PortalError
pub type Result<T> = std::result::Result<T, PortalError>;
