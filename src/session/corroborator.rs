//! Link-layer address lookup for identity corroboration
//!
//! The kernel neighbour table is the only source considered. It can be
//! stale or spoofed, so a corroborator is a hint and never sufficient on
//! its own: it only ever narrows what a token allows.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::types::MacAddr;

/// Default location of the IPv4 neighbour table
pub const PROC_NET_ARP: &str = "/proc/net/arp";

/// ATF_COM: entry is complete
const ARP_FLAG_COMPLETE: u32 = 0x2;

/// Source of corroborating link-layer addresses
#[async_trait]
pub trait CorroboratorSource: Send + Sync {
    /// Link-layer address currently associated with `identity`, if known
    async fn lookup(&self, identity: IpAddr) -> Option<MacAddr>;
}

/// Reads `/proc/net/arp` on every lookup
///
/// Only IPv4 neighbours are covered; IPv6 identities have no corroborator.
#[derive(Debug, Clone)]
pub struct ProcArpTable {
    path: PathBuf,
}

impl ProcArpTable {
    #[must_use]
    pub fn new() -> Self {
        Self::with_path(PROC_NET_ARP)
    }

    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcArpTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CorroboratorSource for ProcArpTable {
    async fn lookup(&self, identity: IpAddr) -> Option<MacAddr> {
        let IpAddr::V4(v4) = identity else {
            return None;
        };
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                trace!(path = %self.path.display(), error = %e, "Neighbour table unavailable");
                return None;
            }
        };
        parse_arp_table(&content).remove(&v4)
    }
}

/// Parse the text format of `/proc/net/arp`
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.20     0x1         0x2         aa:bb:cc:dd:ee:ff     *        wlan0
/// ```
///
/// Incomplete entries (flags without ATF_COM, or an all-zero address) are
/// skipped.
#[must_use]
pub fn parse_arp_table(content: &str) -> HashMap<Ipv4Addr, MacAddr> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let ip: Ipv4Addr = cols.next()?.parse().ok()?;
            let _hw_type = cols.next()?;
            let flags = cols.next()?;
            let flags = u32::from_str_radix(flags.trim_start_matches("0x"), 16).ok()?;
            if flags & ARP_FLAG_COMPLETE == 0 {
                return None;
            }
            let mac: MacAddr = cols.next()?.parse().ok()?;
            if mac.is_zero() {
                return None;
            }
            Some((ip, mac))
        })
        .collect()
}

/// Fixed in-memory table, used when corroboration is disabled or in tests
#[derive(Debug, Default)]
pub struct StaticCorroborators {
    entries: RwLock<HashMap<IpAddr, MacAddr>>,
}

impl StaticCorroborators {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `identity` with `mac`
    pub fn set(&self, identity: IpAddr, mac: MacAddr) {
        self.entries.write().insert(identity, mac);
    }

    pub fn remove(&self, identity: IpAddr) {
        self.entries.write().remove(&identity);
    }
}

#[async_trait]
impl CorroboratorSource for StaticCorroborators {
    async fn lookup(&self, identity: IpAddr) -> Option<MacAddr> {
        self.entries.read().get(&identity).copied()
    }
}
