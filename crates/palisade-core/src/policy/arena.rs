use super::PermissionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, Index, IndexMut};
use std::sync::Arc;

/// Stable identifier of a policy inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(u32);

impl PolicyId {
    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Key under which a sub-policy takes over loading.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Name(String),
    Prefix(String),
    Archive(String),
}

/// Owner of a graph of policies linked by routing maps.
///
/// Routes hold ids, so a sub-policy reachable under several keys is stored
/// once and cycles are representable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyArena {
    nodes: Vec<PermissionPolicy>,
}

impl PolicyArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, policy: PermissionPolicy) -> PolicyId {
        let id = PolicyId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(policy);
        id
    }

    #[must_use]
    pub fn get(&self, id: PolicyId) -> Option<&PermissionPolicy> {
        self.nodes.get(id.index())
    }

    pub fn get_mut(&mut self, id: PolicyId) -> Option<&mut PermissionPolicy> {
        self.nodes.get_mut(id.index())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Let `target` handle units matching `key` when loading under `owner`.
    pub fn route(&mut self, owner: PolicyId, key: RouteKey, target: PolicyId) -> &mut Self {
        let routes = &mut self[owner].routes;
        match key {
            RouteKey::Name(name) => routes.by_name.insert(name, target),
            RouteKey::Prefix(prefix) => routes.by_prefix.insert(prefix, target),
            RouteKey::Archive(archive) => routes.by_archive.insert(archive, target),
        };
        self
    }

    /// Ids reachable from `root` through routes, `root` first.
    #[must_use]
    pub fn reachable(&self, root: PolicyId) -> Vec<PolicyId> {
        let mut seen = vec![root];
        let mut pending = VecDeque::from([root]);
        while let Some(id) = pending.pop_front() {
            for next in self[id].routes.targets() {
                if !seen.contains(&next) {
                    seen.push(next);
                    pending.push_back(next);
                }
            }
        }
        seen
    }

    /// Merge `source` into `target`.
    ///
    /// Rule sets grow, scalar settings take `source`'s values, and the
    /// sub-policy graph behind `source`'s routes is copied with one copy per
    /// distinct node, so shared sub-policies stay shared.
    pub fn merge(&mut self, target: PolicyId, source: PolicyId) {
        self.merge_with(target, source, &mut HashMap::new());
    }

    /// Deep copy of `id` and everything it routes to.
    pub fn clone_policy(&mut self, id: PolicyId) -> PolicyId {
        let copy = self.insert(PermissionPolicy::default());
        let mut cache = HashMap::from([(id, copy)]);
        self.merge_with(copy, id, &mut cache);
        copy
    }

    fn merge_with(&mut self, target: PolicyId, source: PolicyId, cache: &mut HashMap<PolicyId, PolicyId>) {
        let snapshot = Snapshot::reachable_from(self, source);
        let incoming = &snapshot[source];
        let by_name: Vec<_> = incoming
            .routes
            .by_name
            .iter()
            .map(|(k, sub)| (k.clone(), copy_subgraph(&snapshot, self, *sub, cache)))
            .collect();
        let by_prefix: Vec<_> = incoming
            .routes
            .by_prefix
            .iter()
            .map(|(k, sub)| (k.clone(), copy_subgraph(&snapshot, self, *sub, cache)))
            .collect();
        let by_archive: Vec<_> = incoming
            .routes
            .by_archive
            .iter()
            .map(|(k, sub)| (k.clone(), copy_subgraph(&snapshot, self, *sub, cache)))
            .collect();

        let node = &mut self[target];
        node.absorb(incoming);
        node.routes.by_name.extend(by_name);
        node.routes.by_prefix.extend(by_prefix);
        node.routes.by_archive.extend(by_archive);
    }

    /// Copy the subgraph reachable from `root` into a fresh, immutable arena.
    #[must_use]
    pub fn freeze(&self, root: PolicyId) -> PolicyHandle {
        let mut frozen = Self::new();
        let root = copy_subgraph(self, &mut frozen, root, &mut HashMap::new());
        PolicyHandle {
            arena: Arc::new(frozen),
            id: root,
        }
    }

    pub(crate) fn single(mut policy: PermissionPolicy) -> PolicyHandle {
        if !policy.routes.is_empty() {
            tracing::warn!(policy = policy.name(), "routes dropped from a policy frozen outside its arena");
            policy.routes = super::Routes::default();
        }
        let mut arena = Self::new();
        let id = arena.insert(policy);
        PolicyHandle {
            arena: Arc::new(arena),
            id,
        }
    }
}

/// The policies reachable from one node, detached from their arena so it
/// can be mutated while they are read.
struct Snapshot(HashMap<PolicyId, PermissionPolicy>);

impl Snapshot {
    fn reachable_from(arena: &PolicyArena, root: PolicyId) -> Self {
        Self(arena.reachable(root).into_iter().map(|id| (id, arena[id].clone())).collect())
    }
}

impl Index<PolicyId> for Snapshot {
    type Output = PermissionPolicy;

    fn index(&self, id: PolicyId) -> &PermissionPolicy {
        &self.0[&id]
    }
}

/// Copy `id` from `src` into `dst`, reusing copies recorded in `cache`.
fn copy_subgraph<S: Index<PolicyId, Output = PermissionPolicy>>(
    src: &S,
    dst: &mut PolicyArena,
    id: PolicyId,
    cache: &mut HashMap<PolicyId, PolicyId>,
) -> PolicyId {
    if let Some(copied) = cache.get(&id) {
        return *copied;
    }
    // Reserve the slot before recursing so cycles resolve to it.
    let slot = dst.insert(PermissionPolicy::default());
    cache.insert(id, slot);

    let mut node = src[id].clone();
    for sub in node.routes.by_name.values_mut() {
        *sub = copy_subgraph(src, dst, *sub, cache);
    }
    for sub in node.routes.by_prefix.values_mut() {
        *sub = copy_subgraph(src, dst, *sub, cache);
    }
    for sub in node.routes.by_archive.values_mut() {
        *sub = copy_subgraph(src, dst, *sub, cache);
    }
    dst[slot] = node;
    slot
}

impl Index<PolicyId> for PolicyArena {
    type Output = PermissionPolicy;

    fn index(&self, id: PolicyId) -> &PermissionPolicy {
        &self.nodes[id.index()]
    }
}

impl IndexMut<PolicyId> for PolicyArena {
    fn index_mut(&mut self, id: PolicyId) -> &mut PermissionPolicy {
        &mut self.nodes[id.index()]
    }
}

/// Immutable, cheaply cloneable view of one node of a frozen arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyHandle {
    arena: Arc<PolicyArena>,
    id: PolicyId,
}

impl PolicyHandle {
    #[must_use]
    pub const fn id(&self) -> PolicyId {
        self.id
    }

    #[must_use]
    pub fn arena(&self) -> &PolicyArena {
        &self.arena
    }

    /// Handle to another node of the same frozen arena.
    #[must_use]
    pub fn at(&self, id: PolicyId) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
            id,
        }
    }

    /// Whether both handles point at the same node of the same arena.
    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.id == other.id
    }

    /// Address of the frozen arena, stable while any handle to it lives.
    pub(crate) fn arena_key(&self) -> usize {
        Arc::as_ptr(&self.arena).addr()
    }

    /// Handles alive on the frozen arena, this one included.
    pub(crate) fn arena_refs(&self) -> usize {
        Arc::strong_count(&self.arena)
    }
}

impl Deref for PolicyHandle {
    type Target = PermissionPolicy;

    fn deref(&self) -> &PermissionPolicy {
        &self.arena[self.id]
    }
}
