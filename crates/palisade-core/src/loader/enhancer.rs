use super::{CodeLoader, LoadedUnit};
use crate::unit::UnitDefinition;
use std::fmt;
use std::sync::Arc;

/// Hooks into a loader's resolution. Every method defaults to a no-op.
pub trait LoaderEnhancer: Send + Sync {
    /// Called before a unit is resolved. Requests served from the loader's
    /// cache skip it.
    fn before_load(&self, _loader: &CodeLoader, _name: &str) {}

    /// Last resort when neither trusted archives nor the parent know a unit.
    fn fallback_definition(&self, _loader: &CodeLoader, _name: &str) -> Option<UnitDefinition> {
        None
    }

    /// Transform definition bytes of a unit defined inside the sandbox.
    fn enhance(&self, _loader: &CodeLoader, _name: &str, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn after_load(&self, _loader: &CodeLoader, _name: &str, _unit: &Arc<LoadedUnit>) {}

    /// Resolve through the parent domain regardless of the loader settings.
    fn load_with_parent(&self, _name: &str) -> bool {
        false
    }
}

impl fmt::Debug for dyn LoaderEnhancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoaderEnhancer")
    }
}
