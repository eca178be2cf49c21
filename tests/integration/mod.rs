//! Integration tests for captive-portal
//!
//! Every test binds real sockets on `127.0.0.1:0` and uses the in-memory
//! packet filter, so no privileges are needed.
//!
//! # Test Organization
//!
//! - `dns_interceptor`: answers decoded with an independent DNS library
//! - `gateway_http`: login, cookie and redirect flow over TCP
//! - `session_lifecycle`: expiry, sweeping and concurrency against the filter
//! - `ipc_control`: control socket commands against a live portal

pub mod dns_interceptor;
pub mod gateway_http;
pub mod ipc_control;
pub mod session_lifecycle;
pub mod support;
