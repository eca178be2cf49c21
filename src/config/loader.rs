//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/captive-portal/config.json";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        gateway_ip = %config.gateway_ip,
        dns = %config.dns.listen,
        http = %config.http.listen,
        tls = config.http.tls.is_some(),
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `CAPTIVE_PORTAL_GATEWAY_IP`: Override the redirect address
/// - `CAPTIVE_PORTAL_LOG_LEVEL`: Override log level
/// - `CAPTIVE_PORTAL_INTERFACE`: Override the NAT egress interface
/// - `CAPTIVE_PORTAL_SESSION_TIMEOUT`: Override session timeout (seconds)
/// - `CAPTIVE_PORTAL_IPC_SOCKET`: Override IPC socket path
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or re-validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from `lookup` and re-validate
///
/// Split out from [`load_config_with_env`] so tests do not have to mutate
/// the process environment.
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparsable values.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(ip) = lookup("CAPTIVE_PORTAL_GATEWAY_IP") {
        config.gateway_ip = ip.parse().map_err(|_| ConfigError::EnvError {
            name: "CAPTIVE_PORTAL_GATEWAY_IP".into(),
            reason: format!("Invalid IPv4 address: {ip}"),
        })?;
        debug!("Gateway IP overridden to {}", config.gateway_ip);
    }

    if let Some(level) = lookup("CAPTIVE_PORTAL_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(interface) = lookup("CAPTIVE_PORTAL_INTERFACE") {
        config.firewall.interface = interface;
        debug!("Interface overridden to {}", config.firewall.interface);
    }

    if let Some(timeout) = lookup("CAPTIVE_PORTAL_SESSION_TIMEOUT") {
        config.session.timeout_secs = timeout.parse().map_err(|_| ConfigError::EnvError {
            name: "CAPTIVE_PORTAL_SESSION_TIMEOUT".into(),
            reason: format!("Invalid number: {timeout}"),
        })?;
        debug!("Session timeout overridden to {}s", config.session.timeout_secs);
    }

    if let Some(socket) = lookup("CAPTIVE_PORTAL_IPC_SOCKET") {
        config.ipc.socket_path = socket.into();
        debug!("IPC socket path overridden to {:?}", config.ipc.socket_path);
    }

    // Re-validate after overrides
    config.validate()
}
