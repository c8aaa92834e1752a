//! The trusted host side of loading

use crate::result::DomainId;
use crate::unit::UnitDefinition;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Code resolvable by the host, outside any sandbox.
pub trait ParentDomain: Send + Sync {
    fn id(&self) -> DomainId {
        DomainId::host()
    }

    /// The unit as the host itself uses it.
    fn resolve(&self, name: &str) -> Option<UnitDefinition>;

    /// Raw definition a sandbox copies into its own domain. An I/O failure
    /// is reported inside the resulting not-found error.
    fn raw_definition(&self, name: &str) -> std::io::Result<Option<UnitDefinition>> {
        Ok(self.resolve(name))
    }

    fn archive(&self, id: &str) -> Option<Arc<CodeArchive>>;
}

/// A named bundle of unit definitions.
#[derive(Debug, Clone)]
pub struct CodeArchive {
    id: String,
    units: BTreeMap<String, UnitDefinition>,
}

impl CodeArchive {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            units: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_unit(mut self, definition: UnitDefinition) -> Self {
        self.insert(definition);
        self
    }

    pub fn insert(&mut self, definition: UnitDefinition) {
        self.units.insert(definition.name().to_string(), definition);
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&UnitDefinition> {
        self.units.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }
}

/// In-memory parent domain: loose units plus archives.
#[derive(Debug, Default)]
pub struct HostDomain {
    units: RwLock<HashMap<String, UnitDefinition>>,
    archives: RwLock<BTreeMap<String, Arc<CodeArchive>>>,
}

impl HostDomain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: UnitDefinition) -> &Self {
        self.units.write().insert(definition.name().to_string(), definition);
        self
    }

    pub fn register_archive(&self, archive: CodeArchive) -> &Self {
        self.archives.write().insert(archive.id().to_string(), Arc::new(archive));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }
}

impl ParentDomain for HostDomain {
    /// Loose units first, then every archive the host knows.
    fn resolve(&self, name: &str) -> Option<UnitDefinition> {
        if let Some(def) = self.units.read().get(name) {
            return Some(def.clone());
        }
        self.archives.read().values().find_map(|a| a.get(name).cloned())
    }

    fn archive(&self, id: &str) -> Option<Arc<CodeArchive>> {
        self.archives.read().get(id).cloned()
    }
}
