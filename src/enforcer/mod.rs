//! Filter Enforcer
//!
//! Translates session decisions into packet-filter state. The rest of the
//! crate depends only on the [`FilterEnforcer`] trait; the concrete backend
//! is picked from configuration.
//!
//! | Backend | Mechanism |
//! |---|---|
//! | [`IptablesEnforcer`] | `iptables`/`ip6tables`, `conntrack`, `sysctl` via [`CommandExecutor`] |
//! | [`MemoryEnforcer`] | in-process set, for dry runs and tests |
//!
//! Enforcement is best effort. A failed sub-command is logged and reported
//! as an [`EnforcementError`], but never rolls back or aborts the session
//! transition that triggered it.

mod command;
mod iptables;
mod memory;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use command::{
    CommandExecutor, CommandOutput, CommandRunner, CommandSpec, RetryPolicy, SystemCommandRunner,
};
pub use iptables::{parse_accept_rules, IptablesConfig, IptablesEnforcer};
pub use memory::{EnforcerCall, MemoryEnforcer};

use crate::config::{FirewallBackend, FirewallConfig};
use crate::error::EnforcementError;

/// Packet-filter operations the portal relies on
#[async_trait]
pub trait FilterEnforcer: Send + Sync {
    /// Install the baseline: loopback and established traffic accepted,
    /// forwarding denied by default, egress NAT and IP forwarding enabled.
    /// Safe to call on a partially configured filter.
    async fn initialize(&self) -> Result<(), EnforcementError>;

    /// Let `identity` forward traffic. Repeating the call is harmless.
    async fn allow(&self, identity: IpAddr) -> Result<(), EnforcementError>;

    /// Cut `identity` off, including flows that are already established.
    /// Every sub-step is attempted even if an earlier one fails.
    async fn block(&self, identity: IpAddr) -> Result<(), EnforcementError>;

    /// Revert to a fully open filter
    async fn teardown(&self) -> Result<(), EnforcementError>;

    /// Best-effort view of identities with an accept rule
    async fn list_allowed(&self) -> Result<Vec<IpAddr>, EnforcementError>;

    /// Backend name for logs and status
    fn name(&self) -> &'static str;
}

/// Build the enforcer selected by `config`
#[must_use]
pub fn build_enforcer(config: &FirewallConfig) -> Arc<dyn FilterEnforcer> {
    match config.backend {
        FirewallBackend::Iptables => {
            let runner = Arc::new(SystemCommandRunner::new(Duration::from_millis(
                config.command_timeout_ms,
            )));
            let exec = CommandExecutor::new(
                runner,
                RetryPolicy {
                    max_attempts: config.max_attempts,
                    backoff: Duration::from_millis(config.retry_backoff_ms),
                },
            );
            Arc::new(IptablesEnforcer::new(
                exec,
                IptablesConfig {
                    interface: config.interface.clone(),
                    ipv6: config.ipv6,
                },
            ))
        }
        FirewallBackend::Memory => Arc::new(MemoryEnforcer::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_enforcer_selects_backend() {
        let mut config = FirewallConfig::default();
        assert_eq!(build_enforcer(&config).name(), "iptables");

        config.backend = FirewallBackend::Memory;
        assert_eq!(build_enforcer(&config).name(), "memory");
    }
}
