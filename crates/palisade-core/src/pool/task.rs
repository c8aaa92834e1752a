use crate::coordinator::RunMode;
use crate::policy::PolicyHandle;
use crate::unit::Argument;
use serde::{Deserialize, Serialize};

/// A unit invocation shipped to a runtime process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxTask {
    unit: String,
    policy: PolicyHandle,
    mode: RunMode,
    args: Vec<Argument>,
}

impl SandboxTask {
    pub fn new(unit: impl Into<String>, policy: PolicyHandle, mode: RunMode, args: Vec<Argument>) -> Self {
        Self {
            unit: unit.into(),
            policy,
            mode,
            args,
        }
    }

    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    #[must_use]
    pub const fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    #[must_use]
    pub const fn mode(&self) -> RunMode {
        self.mode
    }

    #[must_use]
    pub fn args(&self) -> &[Argument] {
        &self.args
    }
}
