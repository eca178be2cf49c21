//! Configuration module for captive-portal
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use captive_portal::config::load_config;
//!
//! let config = load_config("/etc/captive-portal/config.json").unwrap();
//! println!("Redirecting DNS to {}", config.gateway_ip);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, load_config, load_config_str, load_config_with_env, DEFAULT_CONFIG_PATH,
};
pub use types::{
    Config, DnsConfig, FirewallBackend, FirewallConfig, HttpConfig, IpcConfig, LogConfig,
    SessionConfig, TlsConfig,
};
