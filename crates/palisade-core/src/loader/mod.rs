//! Isolated, tree-structured code loading
//!
//! A [`CodeLoader`] is one node of a loader tree built from a frozen policy:
//! one node per reachable sub-policy, so two routes to the same sub-policy
//! share one nested loader. Resolution of a name:
//! 1. always-trusted or parent-routed names (unless forced inside) come from
//!    the parent domain
//! 2. names owned by a nested loader are delegated to it
//! 3. everything else is defined inside the sandbox from a trusted archive,
//!    the parent's raw definition or the enhancer's fallback
//! 4. units defined inside are enhanced, and untrusted units pass package
//!    and class checks before they are returned

mod domain;
mod enhancer;

pub use domain::{CodeArchive, HostDomain, ParentDomain};
pub use enhancer::LoaderEnhancer;

use crate::enforcer::EnforcementContext;
use crate::policy::{PolicyHandle, PolicyId};
use crate::result::DomainId;
use crate::unit::{Argument, EntryPoint, Finalizer, SandboxedUnit, UnitDefinition};
use crate::{PalisadeError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Namespaces every loader hands to the parent domain
pub const TRUSTED_PREFIXES: &[&str] = &["core.", "palisade."];

static NEXT_TREE: AtomicU64 = AtomicU64::new(1);

/// Where a loaded unit came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOrigin {
    /// The parent domain's own copy
    Parent,
    /// Defined inside the sandbox
    Sandbox,
}

/// A resolved unit, ready to be instantiated.
pub struct LoadedUnit {
    name: String,
    bytes: Vec<u8>,
    entry: Option<EntryPoint>,
    finalizer: Option<Finalizer>,
    trusted: bool,
    origin: UnitOrigin,
    domain: DomainId,
}

impl LoadedUnit {
    fn new(definition: UnitDefinition, trusted: bool, origin: UnitOrigin, domain: DomainId) -> Self {
        let (name, bytes, entry, finalizer) = definition.into_parts();
        Self {
            name,
            bytes,
            entry,
            finalizer,
            trusted,
            origin,
            domain,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Tagged trusted: skips enforcement on load.
    #[must_use]
    pub const fn is_trusted(&self) -> bool {
        self.trusted
    }

    #[must_use]
    pub const fn origin(&self) -> &UnitOrigin {
        &self.origin
    }

    #[must_use]
    pub const fn domain(&self) -> &DomainId {
        &self.domain
    }

    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    pub fn instantiate(&self, args: &[Argument]) -> Result<Box<dyn SandboxedUnit>> {
        let entry = self.entry.as_ref().ok_or_else(|| PalisadeError::ExecutionFailure {
            unit: self.name.clone(),
            message: "unit has no entry point".into(),
        })?;
        entry(args)
    }
}

impl Drop for LoadedUnit {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer();
        }
    }
}

impl fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("name", &self.name)
            .field("trusted", &self.trusted)
            .field("origin", &self.origin)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

struct LoaderNode {
    policy: PolicyHandle,
    domain: DomainId,
    trusted_archives: Vec<Arc<CodeArchive>>,
    parent_archives: Vec<Arc<CodeArchive>>,
    by_name: HashMap<String, usize>,
    by_prefix: Vec<(String, usize)>,
    by_archive: Vec<(Arc<CodeArchive>, usize)>,
    cache: Mutex<HashMap<String, Arc<LoadedUnit>>>,
}

struct LoaderTree {
    parent: Arc<dyn ParentDomain>,
    nodes: Vec<LoaderNode>,
}

/// Handle to one node of a loader tree. Clones share the node.
#[derive(Clone)]
pub struct CodeLoader {
    tree: Arc<LoaderTree>,
    node: usize,
}

impl CodeLoader {
    /// Build the loader tree for `policy` and return its root.
    pub fn new(policy: &PolicyHandle, parent: Arc<dyn ParentDomain>) -> Self {
        let tree_id = NEXT_TREE.fetch_add(1, Ordering::Relaxed);
        let ids = policy.arena().reachable(policy.id());
        let index: HashMap<PolicyId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let archives = |names: &BTreeSet<String>, owner: &str| -> Vec<Arc<CodeArchive>> {
            names
                .iter()
                .filter_map(|archive| {
                    let found = parent.archive(archive);
                    if found.is_none() {
                        tracing::warn!(policy = owner, %archive, "archive unknown to the parent domain");
                    }
                    found
                })
                .collect()
        };

        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let node_policy = policy.at(*id);
                let label = node_policy
                    .loading()
                    .codesource
                    .clone()
                    .unwrap_or_else(|| default_codesource(node_policy.name()));
                let routes = node_policy.routes();
                let mut by_prefix: Vec<(String, usize)> =
                    routes.by_prefix.iter().map(|(p, sub)| (p.clone(), index[sub])).collect();
                // Longest prefix wins.
                by_prefix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                let by_archive = routes
                    .by_archive
                    .iter()
                    .filter_map(|(archive, sub)| {
                        let found = parent.archive(archive);
                        if found.is_none() {
                            tracing::warn!(policy = node_policy.name(), %archive, "routed archive unknown to the parent domain");
                        }
                        found.map(|a| (a, index[sub]))
                    })
                    .collect();

                LoaderNode {
                    domain: DomainId::new(format!("{label}@{tree_id}.{i}")),
                    trusted_archives: archives(node_policy.trusted_archives(), node_policy.name()),
                    parent_archives: archives(&node_policy.loading().parent_archives, node_policy.name()),
                    by_name: routes.by_name.iter().map(|(n, sub)| (n.clone(), index[sub])).collect(),
                    by_prefix,
                    by_archive,
                    cache: Mutex::new(HashMap::new()),
                    policy: node_policy,
                }
            })
            .collect();

        Self {
            tree: Arc::new(LoaderTree { parent, nodes }),
            node: 0,
        }
    }

    fn node(&self) -> &LoaderNode {
        &self.tree.nodes[self.node]
    }

    fn at(&self, node: usize) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            node,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &PolicyHandle {
        &self.node().policy
    }

    #[must_use]
    pub fn domain_id(&self) -> &DomainId {
        &self.node().domain
    }

    #[must_use]
    pub fn parent(&self) -> &Arc<dyn ParentDomain> {
        &self.tree.parent
    }

    /// Whether both handles denote the same node of the same tree.
    #[must_use]
    pub fn same_loader(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.node == other.node
    }

    /// Policy nodes in this loader's tree. Each holds one policy handle.
    pub(crate) fn tree_len(&self) -> usize {
        self.tree.nodes.len()
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.node().cache.lock().contains_key(name)
    }

    /// Resolve `name`, checking untrusted units against `ctx`.
    pub fn load(&self, name: &str, ctx: &EnforcementContext) -> Result<Arc<LoadedUnit>> {
        let node = self.node();
        let policy = &node.policy;
        if policy.is_debug() {
            tracing::info!(loader = %node.domain, unit = name, "about to load unit");
        }
        if let Some(unit) = node.cache.lock().get(name) {
            return Ok(Arc::clone(unit));
        }
        if let Some(enhancer) = policy.enhancer() {
            enhancer.before_load(self, name);
        }

        let unit = if self.resolves_with_parent(name) {
            self.load_from_parent(name)?
        } else if let Some(nested) = self.nested_loader_for(name) {
            if policy.is_debug() {
                tracing::info!(loader = %node.domain, nested = %nested.domain_id(), unit = name, "delegating to nested loader");
            }
            return nested.load(name, ctx);
        } else {
            self.load_inside(name)?
        };

        if !unit.is_trusted() {
            ctx.check_package_access(package_of(name))?;
            ctx.check_class_access(name)?;
        }

        let unit = Arc::clone(node.cache.lock().entry(name.to_string()).or_insert(unit));
        if let Some(enhancer) = policy.enhancer() {
            enhancer.after_load(self, name, &unit);
        }
        Ok(unit)
    }

    /// Define a host-supplied unit in this loader's domain. A unit already
    /// loaded under that name is returned instead.
    pub fn define(&self, definition: UnitDefinition, enhance: bool) -> Result<Arc<LoadedUnit>> {
        let node = self.node();
        let name = definition.name().to_string();
        if let Some(unit) = node.cache.lock().get(&name) {
            return Ok(Arc::clone(unit));
        }
        let definition = if enhance { self.enhance(&name, definition) } else { definition };
        let unit = Arc::new(LoadedUnit::new(definition, false, UnitOrigin::Sandbox, node.domain.clone()));
        Ok(Arc::clone(node.cache.lock().entry(name).or_insert(unit)))
    }

    /// Nested loader owning `name`: archive membership, then exact name,
    /// then prefix.
    #[must_use]
    pub fn nested_loader_for(&self, name: &str) -> Option<Self> {
        let node = self.node();
        node.by_archive
            .iter()
            .find(|(archive, _)| archive.contains(name))
            .map(|(_, i)| *i)
            .or_else(|| node.by_name.get(name).copied())
            .or_else(|| node.by_prefix.iter().find(|(p, _)| name.starts_with(p.as_str())).map(|(_, i)| *i))
            .map(|i| self.at(i))
    }

    /// Search this loader and everything below it for a policy named `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<Self> {
        let mut seen = vec![self.node];
        let mut pending = vec![self.node];
        while let Some(i) = pending.pop() {
            let node = &self.tree.nodes[i];
            if node.policy.name() == name {
                return Some(self.at(i));
            }
            let children = node
                .by_archive
                .iter()
                .map(|(_, c)| *c)
                .chain(node.by_name.values().copied())
                .chain(node.by_prefix.iter().map(|(_, c)| *c));
            for child in children {
                if !seen.contains(&child) {
                    seen.push(child);
                    pending.push(child);
                }
            }
        }
        None
    }

    fn resolves_with_parent(&self, name: &str) -> bool {
        let node = self.node();
        let loading = node.policy.loading();
        let trusted = TRUSTED_PREFIXES.iter().any(|p| name.starts_with(p));
        let bypass = loading.parent_units.contains(name)
            || loading.parent_prefixes.iter().any(|p| name.starts_with(p.as_str()))
            || node.parent_archives.iter().any(|a| a.contains(name))
            || node.policy.enhancer().is_some_and(|e| e.load_with_parent(name));
        if !(trusted || bypass) {
            return false;
        }
        let forced_inside = loading.sandbox_units.contains(name)
            || loading.sandbox_prefixes.iter().any(|p| name.starts_with(p.as_str()));
        !forced_inside
    }

    fn load_from_parent(&self, name: &str) -> Result<Arc<LoadedUnit>> {
        let definition = self.tree.parent.resolve(name).ok_or_else(|| PalisadeError::not_found(name))?;
        let trusted = self.node().trusted_archives.iter().any(|a| a.contains(name));
        Ok(Arc::new(LoadedUnit::new(definition, trusted, UnitOrigin::Parent, self.tree.parent.id())))
    }

    fn load_inside(&self, name: &str) -> Result<Arc<LoadedUnit>> {
        let node = self.node();
        let (definition, trusted) = if let Some(def) = node.trusted_archives.iter().find_map(|a| a.get(name)) {
            (def.clone(), true)
        } else {
            let raw = self.tree.parent.raw_definition(name).map_err(|e| PalisadeError::ResolutionNotFound {
                name: name.to_string(),
                source: Some(e),
            })?;
            let def = raw
                .or_else(|| node.policy.enhancer().and_then(|e| e.fallback_definition(self, name)))
                .ok_or_else(|| PalisadeError::not_found(name))?;
            (def, false)
        };

        let definition = self.enhance(name, definition);
        Ok(Arc::new(LoadedUnit::new(definition, trusted, UnitOrigin::Sandbox, node.domain.clone())))
    }

    fn enhance(&self, name: &str, mut definition: UnitDefinition) -> UnitDefinition {
        let policy = &self.node().policy;
        if policy.loading().remove_finalizers && definition.strip_finalizer() && policy.is_debug() {
            tracing::info!(unit = name, "removed finalizer");
        }
        if let Some(enhancer) = policy.enhancer() {
            let bytes = definition.take_bytes();
            definition.set_bytes(enhancer.enhance(self, name, bytes));
        }
        definition
    }
}

impl fmt::Debug for CodeLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeLoader")
            .field("policy", &self.policy().name())
            .field("domain", self.domain_id())
            .finish()
    }
}

/// Package of a unit: its name up to the last `.`.
#[must_use]
pub fn package_of(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(package, _)| package)
}

fn default_codesource(policy_name: &str) -> String {
    if policy_name.is_empty() {
        "/palisade-default-codesource/default/".to_string()
    } else {
        format!("/palisade-default-codesource/{policy_name}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_is_everything_before_the_last_dot() {
        assert_eq!(package_of("app.safe.Ok"), "app.safe");
        assert_eq!(package_of("Bare"), "");
    }

    #[test]
    fn default_codesource_names_the_policy() {
        assert_eq!(default_codesource("scripts"), "/palisade-default-codesource/scripts/");
        assert_eq!(default_codesource(""), "/palisade-default-codesource/default/");
    }
}
