//! Session record and identity types

use std::borrow::Borrow;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::time::Instant;

/// Random bytes behind each token
pub const TOKEN_BYTES: usize = 32;

/// Opaque session credential handed to the client as a cookie
///
/// 32 bytes from the thread-local CSPRNG, base64url without padding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh random token
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented value
    #[must_use]
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl Borrow<str> for SessionToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Tokens never show up in logs in full
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "SessionToken({prefix}...)")
    }
}

/// Link-layer address used as identity corroboration
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// All-zero address, reported by the kernel for incomplete neighbours
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

/// Error returned when a MAC address string is malformed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacError(pub String);

impl fmt::Display for ParseMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for ParseMacError {}

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

/// What to do when an identity with a live session logs in again
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateLoginPolicy {
    /// Issue a new token; the previous one stops working
    #[default]
    Replace,
    /// Refuse with `AlreadyAuthorized`
    Reject,
}

/// How link-layer corroboration is applied during authorization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorroborationMode {
    /// Ignore corroborators entirely
    Disabled,
    /// A differing corroborator is a mismatch; no address migration
    Strict,
    /// As strict, but a token presented from a new address with the same
    /// corroborator moves the session to that address
    #[default]
    Migrate,
}

/// One authorized network identity
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: IpAddr,
    pub corroborator: Option<MacAddr>,
    pub principal: String,
    pub token: SessionToken,
    pub created_at: Instant,
    pub last_seen_at: Instant,
    /// Wall-clock login time, for reporting only
    pub logged_in_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(
        identity: IpAddr,
        corroborator: Option<MacAddr>,
        principal: String,
        now: Instant,
    ) -> Self {
        Self {
            identity,
            corroborator,
            principal,
            token: SessionToken::generate(),
            created_at: now,
            last_seen_at: now,
            logged_in_at: Utc::now(),
        }
    }

    /// Time since the last authorized request
    #[must_use]
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen_at)
    }

    /// Live iff idle time has not exceeded `timeout`
    #[must_use]
    pub fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        self.idle(now) <= timeout
    }

    /// Refresh `last_seen_at`, never moving it backwards
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }

    #[must_use]
    pub fn view(&self, now: Instant, timeout: Duration) -> SessionView {
        let idle = self.idle(now);
        SessionView {
            identity: self.identity,
            corroborator: self.corroborator.map(|m| m.to_string()),
            principal: self.principal.clone(),
            logged_in_at: self.logged_in_at,
            idle_secs: idle.as_secs(),
            expires_in_secs: timeout.saturating_sub(idle).as_secs(),
        }
    }
}

/// Read-only snapshot of a session for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub identity: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corroborator: Option<String>,
    pub principal: String,
    pub logged_in_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub expires_in_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        // 32 bytes -> 43 base64url characters
        assert_eq!(a.as_str().len(), 43);
        assert!(a
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_token_matching() {
        let token = SessionToken::generate();
        let copy = token.as_str().to_string();
        assert!(token.matches(&copy));
        assert!(!token.matches(&copy[1..]));
        assert!(!token.matches(""));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = SessionToken::generate();
        let debug = format!("{token:?}");
        assert!(!debug.contains(token.as_str()));
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "AA:bb:0c:dd:ee:01".parse().unwrap();
        assert_eq!(mac.0, [0xaa, 0xbb, 0x0c, 0xdd, 0xee, 0x01]);
        assert_eq!(mac.to_string(), "aa:bb:0c:dd:ee:01");
        assert!("00-00-00-00-00-00".parse::<MacAddr>().unwrap().is_zero());

        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:gg".parse::<MacAddr>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_boundary() {
        let now = Instant::now();
        let session = Session::new("10.0.0.5".parse().unwrap(), None, "alice".into(), now);
        let timeout = Duration::from_secs(60);

        assert!(session.is_live(now + timeout, timeout));
        assert!(!session.is_live(now + timeout + Duration::from_millis(1), timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_is_monotonic() {
        let now = Instant::now();
        let mut session = Session::new("10.0.0.5".parse().unwrap(), None, "alice".into(), now);
        let later = now + Duration::from_secs(10);
        session.touch(later);
        session.touch(now);
        assert_eq!(session.last_seen_at, later);
        assert!(session.last_seen_at >= session.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view() {
        let now = Instant::now();
        let session = Session::new(
            "10.0.0.5".parse().unwrap(),
            Some(MacAddr([1, 2, 3, 4, 5, 6])),
            "alice".into(),
            now,
        );
        let view = session.view(now + Duration::from_secs(20), Duration::from_secs(60));
        assert_eq!(view.principal, "alice");
        assert_eq!(view.idle_secs, 20);
        assert_eq!(view.expires_in_secs, 40);
        assert_eq!(view.corroborator.as_deref(), Some("01:02:03:04:05:06"));
    }
}
