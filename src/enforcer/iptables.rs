//! `iptables`/`conntrack` backend
//!
//! # Rule Layout
//!
//! ```text
//! filter/FORWARD (policy DROP)
//!   1  -s <blocked> -p tcp -j REJECT --reject-with tcp-reset   <- inserted by block
//!   2  -s <blocked> -j DROP                                    <- inserted by block
//!   .  -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT    <- baseline
//!   .  -s <allowed> -j ACCEPT                                  <- appended by allow
//! nat/POSTROUTING
//!   .  -o <interface> -j MASQUERADE                            <- baseline
//! ```
//!
//! Deny rules sit above the established/related accept so a block cuts
//! existing flows as well as new ones. Every rule is checked with `-C`
//! before it is added, so repeating any operation leaves one copy.

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::command::{CommandExecutor, CommandSpec};
use super::FilterEnforcer;
use crate::error::EnforcementError;

/// Upper bound on duplicate rules removed for one identity in one call
const MAX_DUPLICATE_RULES: usize = 16;

/// conntrack exits 1 with this message when nothing matched
const CONNTRACK_NOTHING_DELETED: &str = "0 flow entries have been deleted";

/// iptables exit status for "no matching rule"
const IPTABLES_RULE_ABSENT: i32 = 1;

/// Backend settings
#[derive(Debug, Clone)]
pub struct IptablesConfig {
    /// Egress interface for the MASQUERADE rule
    pub interface: String,
    /// Also manage the `ip6tables` filter baseline
    pub ipv6: bool,
}

/// Where a rule goes when it is missing
#[derive(Debug, Clone, Copy)]
enum Placement {
    Append,
    Top,
}

/// Tracks sub-step outcomes of one compound operation
struct StepReport {
    operation: &'static str,
    target: String,
    attempted: usize,
    failed: usize,
}

impl StepReport {
    fn new(operation: &'static str, target: impl Into<String>) -> Self {
        Self {
            operation,
            target: target.into(),
            attempted: 0,
            failed: 0,
        }
    }

    fn record(&mut self, step: &str, result: Result<(), EnforcementError>) {
        self.attempted += 1;
        if let Err(e) = result {
            self.failed += 1;
            warn!(
                operation = self.operation,
                target = %self.target,
                step,
                error = %e,
                "Enforcement step failed"
            );
        }
    }

    fn finish(self) -> Result<(), EnforcementError> {
        if self.failed == 0 {
            return Ok(());
        }
        if self.failed == self.attempted {
            error!(
                operation = self.operation,
                target = %self.target,
                attempted = self.attempted,
                "Every enforcement step failed"
            );
        }
        Err(EnforcementError::Partial {
            operation: self.operation,
            target: self.target,
            failed: self.failed,
            attempted: self.attempted,
        })
    }
}

/// Enforcer that drives the kernel filter through `iptables` and `conntrack`
#[derive(Debug, Clone)]
pub struct IptablesEnforcer {
    exec: CommandExecutor,
    config: IptablesConfig,
}

impl IptablesEnforcer {
    #[must_use]
    pub fn new(exec: CommandExecutor, config: IptablesConfig) -> Self {
        Self { exec, config }
    }

    const fn tool(identity: IpAddr) -> &'static str {
        match identity {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    fn families(&self) -> &'static [&'static str] {
        if self.config.ipv6 {
            &["iptables", "ip6tables"]
        } else {
            &["iptables"]
        }
    }

    /// `<tool> -w -t <table> <action> <chain> [position] <rule...>`
    fn rule_command(
        tool: &str,
        table: &str,
        action: &str,
        chain: &str,
        position: Option<&str>,
        rule: &[&str],
    ) -> CommandSpec {
        CommandSpec::new(tool)
            .args(["-w", "-t", table, action, chain])
            .args(position)
            .args(rule.iter().copied())
    }

    /// Add `rule` unless an identical one is already present
    async fn ensure_rule(
        &self,
        tool: &str,
        table: &str,
        chain: &str,
        rule: &[&str],
        placement: Placement,
    ) -> Result<(), EnforcementError> {
        let check = Self::rule_command(tool, table, "-C", chain, None, rule);
        if self.exec.probe(&check).await {
            return Ok(());
        }

        let add = match placement {
            Placement::Append => Self::rule_command(tool, table, "-A", chain, None, rule),
            Placement::Top => Self::rule_command(tool, table, "-I", chain, Some("1"), rule),
        };
        self.exec.execute(&add).await.map(|_| ())
    }

    /// Delete every copy of `rule`, returning how many were removed
    ///
    /// Exit 1 ends the loop as "no copy left". Anything else that is not a
    /// success is an error, after the executor's retries.
    async fn delete_rule(
        &self,
        tool: &str,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<usize, EnforcementError> {
        let delete = Self::rule_command(tool, table, "-D", chain, None, rule);
        let mut removed = 0;
        while removed < MAX_DUPLICATE_RULES {
            let output = self
                .exec
                .execute_accepting(&delete, |o| o.status == Some(IPTABLES_RULE_ABSENT))
                .await?;
            if !output.is_success() {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Drop connection-tracking entries in one direction
    async fn flush_conntrack(&self, identity: IpAddr, direction: &str) -> Result<(), EnforcementError> {
        let family = match identity {
            IpAddr::V4(_) => "ipv4",
            IpAddr::V6(_) => "ipv6",
        };
        let command = CommandSpec::new("conntrack")
            .args(["-D", "-f", family, direction])
            .arg(identity.to_string());

        self.exec
            .execute_accepting(&command, |o| o.stderr.contains(CONNTRACK_NOTHING_DELETED))
            .await
            .map(|_| ())
    }

    async fn sysctl_forwarding(&self, enabled: bool) -> Result<(), EnforcementError> {
        let value = if enabled { "1" } else { "0" };
        let command = CommandSpec::new("sysctl")
            .arg("-w")
            .arg(format!("net.ipv4.ip_forward={value}"));
        self.exec.execute(&command).await.map(|_| ())
    }
}

#[async_trait]
impl FilterEnforcer for IptablesEnforcer {
    async fn initialize(&self) -> Result<(), EnforcementError> {
        let mut report = StepReport::new("initialize", "baseline");

        for &tool in self.families() {
            report.record(
                "accept loopback",
                self.ensure_rule(tool, "filter", "INPUT", &["-i", "lo", "-j", "ACCEPT"], Placement::Append)
                    .await,
            );
            report.record(
                "accept established",
                self.ensure_rule(
                    tool,
                    "filter",
                    "FORWARD",
                    &["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
                    Placement::Append,
                )
                .await,
            );
            let policy = CommandSpec::new(tool).args(["-w", "-P", "FORWARD", "DROP"]);
            report.record(
                "default deny",
                self.exec.execute(&policy).await.map(|_| ()),
            );
        }

        let interface = self.config.interface.as_str();
        report.record(
            "masquerade",
            self.ensure_rule(
                "iptables",
                "nat",
                "POSTROUTING",
                &["-o", interface, "-j", "MASQUERADE"],
                Placement::Append,
            )
            .await,
        );
        report.record("ip forwarding", self.sysctl_forwarding(true).await);

        let result = report.finish();
        if result.is_ok() {
            info!(interface = %self.config.interface, "Filter baseline installed");
        }
        result
    }

    async fn allow(&self, identity: IpAddr) -> Result<(), EnforcementError> {
        let tool = Self::tool(identity);
        let source = identity.to_string();
        let mut report = StepReport::new("allow", source.clone());

        // Clear any earlier block first, it would shadow the accept
        report.record(
            "clear tcp reset",
            self.delete_rule(
                tool,
                "filter",
                "FORWARD",
                &["-s", &source, "-p", "tcp", "-j", "REJECT", "--reject-with", "tcp-reset"],
            )
            .await
            .map(|_| ()),
        );
        report.record(
            "clear drop",
            self.delete_rule(tool, "filter", "FORWARD", &["-s", &source, "-j", "DROP"])
                .await
                .map(|_| ()),
        );

        report.record(
            "accept",
            self.ensure_rule(tool, "filter", "FORWARD", &["-s", &source, "-j", "ACCEPT"], Placement::Append)
                .await,
        );

        let result = report.finish();
        if result.is_ok() {
            info!(identity = %identity, "Forwarding allowed");
        }
        result
    }

    async fn block(&self, identity: IpAddr) -> Result<(), EnforcementError> {
        let tool = Self::tool(identity);
        let source = identity.to_string();
        let mut report = StepReport::new("block", source.clone());

        let deleted = self
            .delete_rule(tool, "filter", "FORWARD", &["-s", &source, "-j", "ACCEPT"])
            .await;
        let removed = deleted.as_ref().map_or(0, |n| *n);
        report.record("remove accept", deleted.map(|_| ()));

        report.record(
            "drop",
            self.ensure_rule(tool, "filter", "FORWARD", &["-s", &source, "-j", "DROP"], Placement::Top)
                .await,
        );
        report.record(
            "tcp reset",
            self.ensure_rule(
                tool,
                "filter",
                "FORWARD",
                &["-s", &source, "-p", "tcp", "-j", "REJECT", "--reject-with", "tcp-reset"],
                Placement::Top,
            )
            .await,
        );
        report.record("conntrack source", self.flush_conntrack(identity, "-s").await);
        report.record("conntrack destination", self.flush_conntrack(identity, "-d").await);

        let result = report.finish();
        if result.is_ok() {
            info!(identity = %identity, accept_rules_removed = removed, "Forwarding blocked");
        }
        result
    }

    async fn teardown(&self) -> Result<(), EnforcementError> {
        let mut report = StepReport::new("teardown", "baseline");

        for &tool in self.families() {
            for chain in ["INPUT", "FORWARD", "OUTPUT"] {
                let policy = CommandSpec::new(tool).args(["-w", "-P", chain, "ACCEPT"]);
                report.record("accept policy", self.exec.execute(&policy).await.map(|_| ()));
            }
            for flag in ["-F", "-X"] {
                let flush = CommandSpec::new(tool).args(["-w", flag]);
                report.record("flush filter", self.exec.execute(&flush).await.map(|_| ()));
            }
        }
        for flag in ["-F", "-X"] {
            let flush = CommandSpec::new("iptables").args(["-w", "-t", "nat", flag]);
            report.record("flush nat", self.exec.execute(&flush).await.map(|_| ()));
        }
        report.record("ip forwarding", self.sysctl_forwarding(false).await);

        let result = report.finish();
        if result.is_ok() {
            info!("Filter reverted to open baseline");
        }
        result
    }

    async fn list_allowed(&self) -> Result<Vec<IpAddr>, EnforcementError> {
        let mut allowed = Vec::new();
        for &tool in self.families() {
            let command = CommandSpec::new(tool).args(["-w", "-S", "FORWARD"]);
            let output = self.exec.execute(&command).await?;
            allowed.extend(parse_accept_rules(&output.stdout));
        }
        allowed.sort();
        allowed.dedup();
        Ok(allowed)
    }

    fn name(&self) -> &'static str {
        "iptables"
    }
}

/// Extract source addresses of plain per-source ACCEPT rules from
/// `iptables -S` output
#[must_use]
pub fn parse_accept_rules(listing: &str) -> Vec<IpAddr> {
    listing
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.first() != Some(&"-A") || !tokens.windows(2).any(|w| w == ["-j", "ACCEPT"]) {
                return None;
            }
            // Skip the established/related rule and anything else with matches
            if tokens.contains(&"-m") || tokens.contains(&"-p") {
                return None;
            }
            let source = tokens.windows(2).find(|w| w[0] == "-s")?[1];
            let host = source.split('/').next()?;
            host.parse().ok()
        })
        .collect()
}
