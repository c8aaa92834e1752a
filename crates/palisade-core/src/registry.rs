//! Named policies, shared by the coordinator and runtime processes

use crate::policy::PolicyHandle;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PolicyRegistry {
    contexts: RwLock<HashMap<String, PolicyHandle>>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `policy` under `name`, returning the policy it replaced.
    pub fn register(&self, name: impl Into<String>, policy: PolicyHandle) -> Option<PolicyHandle> {
        let name = name.into();
        tracing::debug!(context = %name, policy = policy.name(), "context registered");
        self.contexts.write().insert(name, policy)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<PolicyHandle> {
        self.contexts.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<PolicyHandle> {
        self.contexts.write().remove(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contexts.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }
}
