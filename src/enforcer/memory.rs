//! In-memory enforcer
//!
//! Keeps the allowed set in process memory and records every call. Used for
//! dry runs (`firewall.backend = "memory"`) and as the observable enforcer
//! in tests.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::FilterEnforcer;
use crate::error::EnforcementError;

/// One recorded enforcer call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcerCall {
    Initialize,
    Allow(IpAddr),
    Block(IpAddr),
    Teardown,
}

#[derive(Debug, Default)]
struct State {
    initialized: bool,
    allowed: BTreeSet<IpAddr>,
    calls: Vec<EnforcerCall>,
}

/// Enforcer with no side effects outside the process
#[derive(Debug, Default)]
pub struct MemoryEnforcer {
    state: Mutex<State>,
    failing: AtomicBool,
}

impl MemoryEnforcer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail after being recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every call so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<EnforcerCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls equal to `call`
    #[must_use]
    pub fn count(&self, call: EnforcerCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    #[must_use]
    pub fn is_allowed(&self, identity: IpAddr) -> bool {
        self.state.lock().allowed.contains(&identity)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn check_failing(&self, operation: &'static str, target: String) -> Result<(), EnforcementError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EnforcementError::Partial {
                operation,
                target,
                failed: 1,
                attempted: 1,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FilterEnforcer for MemoryEnforcer {
    async fn initialize(&self) -> Result<(), EnforcementError> {
        {
            let mut state = self.state.lock();
            state.calls.push(EnforcerCall::Initialize);
            state.initialized = true;
        }
        info!("In-memory filter baseline installed");
        self.check_failing("initialize", "baseline".into())
    }

    async fn allow(&self, identity: IpAddr) -> Result<(), EnforcementError> {
        self.state.lock().calls.push(EnforcerCall::Allow(identity));
        self.check_failing("allow", identity.to_string())?;
        self.state.lock().allowed.insert(identity);
        debug!(identity = %identity, "Allowed (memory)");
        Ok(())
    }

    async fn block(&self, identity: IpAddr) -> Result<(), EnforcementError> {
        self.state.lock().calls.push(EnforcerCall::Block(identity));
        self.check_failing("block", identity.to_string())?;
        self.state.lock().allowed.remove(&identity);
        debug!(identity = %identity, "Blocked (memory)");
        Ok(())
    }

    async fn teardown(&self) -> Result<(), EnforcementError> {
        {
            let mut state = self.state.lock();
            state.calls.push(EnforcerCall::Teardown);
            state.allowed.clear();
            state.initialized = false;
        }
        info!("In-memory filter reverted");
        self.check_failing("teardown", "baseline".into())
    }

    async fn list_allowed(&self) -> Result<Vec<IpAddr>, EnforcementError> {
        self.check_failing("list_allowed", "filter".into())?;
        Ok(self.state.lock().allowed.iter().copied().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
