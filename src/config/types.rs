//! Configuration types for captive-portal
//!
//! Configuration is a single JSON document. Every section except
//! `gateway_ip` has defaults, so the smallest valid file is
//! `{"gateway_ip": "192.168.1.1"}`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::session::{AuthorityConfig, CorroborationMode, DuplicateLoginPolicy};
use crate::wire::RequestLimits;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address every DNS answer points to, and the portal's own address
    pub gateway_ip: Ipv4Addr,

    /// DNS interceptor
    #[serde(default)]
    pub dns: DnsConfig,

    /// Login portal listener(s)
    #[serde(default)]
    pub http: HttpConfig,

    /// Session lifetime and duplicate-login handling
    #[serde(default)]
    pub session: SessionConfig,

    /// Packet filter backend
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// JSON user store
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,

    /// IPC configuration
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Upper bound on waiting for in-flight work at shutdown
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_ip.is_unspecified() || self.gateway_ip.is_broadcast() {
            return Err(ConfigError::validation(format!(
                "gateway_ip {} is not a usable host address",
                self.gateway_ip
            )));
        }

        self.dns.validate()?;
        self.http.validate()?;
        self.session.validate()?;
        self.firewall.validate()?;
        self.ipc.validate()?;
        self.log.validate()?;

        if self.users_file.as_os_str().is_empty() {
            return Err(ConfigError::validation("users_file cannot be empty"));
        }

        if self.dns.enabled && self.dns.listen.port() != 0 && self.dns.listen == self.http.listen {
            return Err(ConfigError::validation(
                "dns.listen and http.listen must differ",
            ));
        }

        Ok(())
    }

    /// Minimal configuration for the given gateway address
    #[must_use]
    pub fn with_gateway(gateway_ip: Ipv4Addr) -> Self {
        Self {
            gateway_ip,
            dns: DnsConfig::default(),
            http: HttpConfig::default(),
            session: SessionConfig::default(),
            firewall: FirewallConfig::default(),
            users_file: default_users_file(),
            ipc: IpcConfig::default(),
            log: LogConfig::default(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
        }
    }

    /// Get shutdown drain bound as Duration
    #[must_use]
    pub const fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }
}

/// DNS interceptor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// UDP listen address
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,

    /// Run the interceptor at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// TTL of every answer
    #[serde(default = "default_answer_ttl_secs")]
    pub answer_ttl_secs: u32,

    /// Queries answered concurrently; excess queries are dropped
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl DnsConfig {
    /// Validate DNS configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::validation(
                "dns.max_in_flight must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: default_dns_listen(),
            enabled: true,
            answer_ttl_secs: default_answer_ttl_secs(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// HTTP(S) listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Plain HTTP listen address
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,

    /// Concurrent connections across all listeners
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Time allowed for a client to send one complete request
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Largest request head accepted
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Largest request body accepted
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Optional HTTPS listener
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl HttpConfig {
    /// Validate HTTP configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::validation(
                "http.max_connections must be greater than 0",
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "http.read_timeout_ms must be greater than 0",
            ));
        }
        if self.max_header_bytes < 256 {
            return Err(ConfigError::validation(
                "http.max_header_bytes must be at least 256",
            ));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
            if tls.listen == self.listen && tls.listen.port() != 0 {
                return Err(ConfigError::validation(
                    "http.tls.listen must differ from http.listen",
                ));
            }
        }
        Ok(())
    }

    /// Get read timeout as Duration
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Framing limits for the request reader
    #[must_use]
    pub const fn request_limits(&self) -> RequestLimits {
        RequestLimits {
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            max_connections: default_max_connections(),
            read_timeout_ms: default_read_timeout_ms(),
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
            tls: None,
        }
    }
}

/// Certificate material for the HTTPS listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,

    /// PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub key_path: PathBuf,

    /// HTTPS listen address
    #[serde(default = "default_https_listen")]
    pub listen: SocketAddr,
}

impl TlsConfig {
    /// Validate TLS configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_path.as_os_str().is_empty() || self.key_path.as_os_str().is_empty() {
            return Err(ConfigError::validation(
                "http.tls requires both cert_path and key_path",
            ));
        }
        Ok(())
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Idle timeout in seconds
    #[serde(default = "default_session_timeout_secs")]
    pub timeout_secs: u64,

    /// Expiry sweep period in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Behaviour when a live identity logs in again
    #[serde(default)]
    pub duplicate_login: DuplicateLoginPolicy,

    /// Link-layer corroboration mode
    #[serde(default)]
    pub corroboration: CorroborationMode,

    /// Name of the session cookie
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::validation(
                "session.timeout_secs must be greater than 0",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::validation(
                "session.sweep_interval_secs must be greater than 0",
            ));
        }
        let valid_cookie = !self.cookie_name.is_empty()
            && self
                .cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_cookie {
            return Err(ConfigError::validation(format!(
                "session.cookie_name {:?} must be non-empty and contain only [A-Za-z0-9_-]",
                self.cookie_name
            )));
        }
        Ok(())
    }

    /// Get session timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get sweep interval as Duration
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Settings for the session authority
    #[must_use]
    pub const fn authority_config(&self) -> AuthorityConfig {
        AuthorityConfig {
            timeout: self.timeout(),
            duplicate_login: self.duplicate_login,
            corroboration: self.corroboration,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            duplicate_login: DuplicateLoginPolicy::default(),
            corroboration: CorroborationMode::default(),
            cookie_name: default_cookie_name(),
        }
    }
}

/// Packet filter backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallBackend {
    /// `iptables`/`conntrack` command-line tools
    #[default]
    Iptables,
    /// No kernel changes; decisions are only tracked in memory
    Memory,
}

/// Packet filter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub backend: FirewallBackend,

    /// Egress interface for NAT
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Also manage the IPv6 filter baseline
    #[serde(default)]
    pub ipv6: bool,

    /// Attempts per filter command, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Kill a filter command after this long
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl FirewallConfig {
    /// Validate firewall configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty()
            || self.interface.len() > 15
            || self.interface.contains(|c: char| c.is_whitespace() || c == '/')
        {
            return Err(ConfigError::validation(format!(
                "firewall.interface {:?} is not a valid interface name",
                self.interface
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::validation(
                "firewall.max_attempts must be at least 1",
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "firewall.command_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: FirewallBackend::default(),
            interface: default_interface(),
            ipv6: false,
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// IPC configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Path to Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Socket file mode (octal, e.g., 0o660)
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Enable IPC server
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl IpcConfig {
    /// Validate IPC configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::validation(
                "IPC socket path cannot be empty when IPC is enabled",
            ));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::validation(
                "max_message_size must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            enabled: true,
            max_message_size: default_max_message_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level or filter directive (e.g. "info", "captive_portal=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::validation(format!(
                "log.format must be \"json\" or \"text\", got {:?}",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

fn default_dns_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

fn default_https_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

const fn default_answer_ttl_secs() -> u32 {
    60
}

const fn default_max_in_flight() -> usize {
    256
}

const fn default_max_connections() -> usize {
    512
}

const fn default_read_timeout_ms() -> u64 {
    10_000
}

const fn default_max_header_bytes() -> usize {
    8192
}

const fn default_max_body_bytes() -> usize {
    64 * 1024
}

const fn default_session_timeout_secs() -> u64 {
    3600
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_cookie_name() -> String {
    "portal_session".into()
}

fn default_interface() -> String {
    "eth0".into()
}

const fn default_max_attempts() -> u32 {
    2
}

const fn default_retry_backoff_ms() -> u64 {
    100
}

const fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_users_file() -> PathBuf {
    PathBuf::from("/etc/captive-portal/users.json")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/captive-portal.sock")
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_shutdown_drain_secs() -> u64 {
    5
}
