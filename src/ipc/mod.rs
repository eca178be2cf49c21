//! IPC (Inter-Process Communication) module
//!
//! Unix socket control channel for a running portal: status, session and
//! filter listings, operator revocation and shutdown.
//!
//! # Protocol
//!
//! Messages are length-prefixed JSON:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded command or response
//!
//! # Example
//!
//! ```no_run
//! use captive_portal::ipc::{IpcClient, IpcCommand, IpcResponse};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IpcClient::new("/run/captive-portal.sock");
//!
//! if client.ping().await? {
//!     println!("Portal is alive");
//! }
//!
//! let response = client.send(IpcCommand::Revoke { identity: "10.0.0.5".parse()? }).await?;
//! if let IpcResponse::Revoked { existed, .. } = response {
//!     println!("Session existed: {existed}");
//! }
//! # Ok(())
//! # }
//! ```

mod handler;
mod protocol;
mod server;

pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, ErrorCode, ErrorResponse, IpcCommand, IpcResponse,
    StatusResponse, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{IpcClient, IpcServer};
