//! Execution result types

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Portable value exchanged with sandboxed units
pub type Value = serde_json::Value;

/// Identity of the loading domain a value was produced in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(String);

impl DomainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Domain of the trusted host itself
    #[must_use]
    pub fn host() -> Self {
        Self("host".into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Re-expresses a value produced in one loading domain for another.
pub trait Bridge: Send + Sync {
    fn bridge(&self, value: Value, target: &DomainId) -> Result<Value>;
}

/// Bridge for portable values, which need no translation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughBridge;

impl Bridge for PassthroughBridge {
    fn bridge(&self, value: Value, _target: &DomainId) -> Result<Value> {
        Ok(value)
    }
}

/// Result of a sandboxed call: the raw value plus the domain it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxedCallResult {
    raw: Value,
    origin: DomainId,
}

impl SandboxedCallResult {
    #[must_use]
    pub const fn new(raw: Value, origin: DomainId) -> Self {
        Self { raw, origin }
    }

    #[must_use]
    pub const fn raw(&self) -> &Value {
        &self.raw
    }

    #[must_use]
    pub fn into_raw(self) -> Value {
        self.raw
    }

    #[must_use]
    pub const fn origin(&self) -> &DomainId {
        &self.origin
    }

    /// Value as seen from `target`, bridged when the domains differ.
    pub fn get(&self, bridge: &dyn Bridge, target: &DomainId) -> Result<Value> {
        if &self.origin == target {
            return Ok(self.raw.clone());
        }
        bridge.bridge(self.raw.clone(), target)
    }
}
