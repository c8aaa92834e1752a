//! Per-execution enforcement
//!
//! An [`EnforcementContext`] travels with one execution. While armed with a
//! policy it mediates class, package and permission requests; while a check
//! is running nested checks are skipped and disarming is refused.

use crate::exec::ExecutionState;
use crate::policy::{Permission, PolicyHandle};
use crate::stack::AccessStack;
use crate::{PalisadeError, Result};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Secret presented to disarm the context that was armed with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArmToken(Uuid);

impl ArmToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ArmToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Armed {
    token: ArmToken,
    policy: PolicyHandle,
}

#[derive(Debug)]
pub struct EnforcementContext {
    armed: RefCell<Option<Armed>>,
    in_check: Cell<bool>,
    debug: Cell<bool>,
    execution: Arc<ExecutionState>,
}

impl Default for EnforcementContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EnforcementContext {
    #[must_use]
    pub fn new() -> Self {
        Self::for_execution(ExecutionState::new())
    }

    #[must_use]
    pub const fn for_execution(execution: Arc<ExecutionState>) -> Self {
        Self {
            armed: RefCell::new(None),
            in_check: Cell::new(false),
            debug: Cell::new(false),
            execution,
        }
    }

    /// Context for a thread started from this one. The armed state is
    /// copied now; later changes on either side are not shared.
    #[must_use]
    pub fn inherit(&self) -> Self {
        Self {
            armed: RefCell::new(self.armed.borrow().clone()),
            in_check: Cell::new(false),
            debug: Cell::new(self.debug.get()),
            execution: self.execution.child(),
        }
    }

    pub fn arm(&self, token: &ArmToken, policy: PolicyHandle) -> Result<()> {
        let mut armed = self.armed.borrow_mut();
        if armed.is_some() {
            return Err(PalisadeError::AlreadyArmed);
        }
        self.debug.set(policy.is_debug());
        if policy.is_debug() {
            tracing::info!(policy = policy.name(), "enforcement armed");
        }
        *armed = Some(Armed {
            token: token.clone(),
            policy,
        });
        Ok(())
    }

    /// Arm with a fresh token and return it.
    pub fn arm_new(&self, policy: PolicyHandle) -> Result<ArmToken> {
        let token = ArmToken::generate();
        self.arm(&token, policy)?;
        Ok(token)
    }

    pub fn disarm(&self, token: &ArmToken) -> Result<()> {
        if self.in_check.get() {
            return Err(PalisadeError::InCheck);
        }
        let mut armed = self.armed.borrow_mut();
        if !armed.as_ref().is_some_and(|a| &a.token == token) {
            return Err(PalisadeError::WrongToken);
        }
        if let Some(previous) = armed.take() {
            if self.debug.get() {
                tracing::info!(policy = previous.policy.name(), "enforcement disarmed");
            }
        }
        self.debug.set(false);
        Ok(())
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.borrow().is_some()
    }

    #[must_use]
    pub fn is_in_check(&self) -> bool {
        self.in_check.get()
    }

    #[must_use]
    pub fn policy(&self) -> Option<PolicyHandle> {
        self.armed.borrow().as_ref().map(|a| a.policy.clone())
    }

    #[must_use]
    pub const fn execution(&self) -> &Arc<ExecutionState> {
        &self.execution
    }

    #[must_use]
    pub fn access_stack(&self) -> AccessStack {
        self.execution.access_stack()
    }

    /// Run `f` with the in-check flag raised, restoring it afterwards even
    /// if `f` unwinds.
    pub fn guarded<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        struct Restore<'a> {
            flag: &'a Cell<bool>,
            previous: bool,
        }

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.flag.set(self.previous);
            }
        }

        let _restore = Restore {
            flag: &self.in_check,
            previous: self.in_check.replace(true),
        };
        f(self)
    }

    /// Policy to check against, or `None` when checks are inactive.
    fn active_policy(&self) -> Option<PolicyHandle> {
        if self.in_check.get() {
            return None;
        }
        self.policy()
    }

    pub fn check_class_access(&self, name: &str) -> Result<()> {
        let Some(policy) = self.active_policy() else {
            return Ok(());
        };
        self.guarded(|ctx| {
            if ctx.debug.get() {
                tracing::info!(policy = policy.name(), class = name, "checking class access");
            }
            if policy.bypass_class_checks() || policy.is_pass_all() {
                return Ok(());
            }
            let stack = ctx.access_stack();
            if policy.check_class_access(name, &stack) {
                return Ok(());
            }
            ctx.denied(&policy, format!("class {name}"), &stack)
        })
    }

    pub fn check_package_access(&self, package: &str) -> Result<()> {
        let Some(policy) = self.active_policy() else {
            return Ok(());
        };
        self.guarded(|ctx| {
            if ctx.debug.get() {
                tracing::info!(policy = policy.name(), package, "checking package access");
            }
            if policy.bypass_package_checks() || policy.is_pass_all() {
                return Ok(());
            }
            let stack = ctx.access_stack();
            if policy.check_package_access(package, &stack) {
                return Ok(());
            }
            ctx.denied(&policy, format!("package {package}"), &stack)
        })
    }

    pub fn check_permission(&self, permission: &Permission) -> Result<()> {
        let Some(policy) = self.active_policy() else {
            return Ok(());
        };
        self.guarded(|ctx| {
            if ctx.debug.get() {
                tracing::info!(policy = policy.name(), %permission, "checking permission");
            }
            if policy.bypass_permission_checks() || policy.is_pass_all() {
                return Ok(());
            }
            let stack = ctx.access_stack();
            if policy.check_permission(permission, &stack) {
                return Ok(());
            }
            ctx.denied(&policy, format!("permission {permission}"), &stack)
        })
    }

    fn denied(&self, policy: &PolicyHandle, request: String, stack: &AccessStack) -> Result<()> {
        if self.debug.get() {
            tracing::warn!(policy = policy.name(), request = %request, "access denied, stack:\n{stack}");
        }
        Err(PalisadeError::AccessDenied { request })
    }
}
