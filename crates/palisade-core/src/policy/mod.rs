//! Permission policies
//!
//! A [`PermissionPolicy`] describes what one sandboxed scope may load, touch
//! and how long it may run. Policies that route parts of the code to nested
//! sub-policies live in a [`PolicyArena`]; everything downstream of
//! configuration sees an immutable [`PolicyHandle`].

mod arena;
pub mod file;
pub mod permission;

pub use arena::{PolicyArena, PolicyHandle, PolicyId, RouteKey};
pub use file::{FileMatcher, FileRegex, FileRule, FileRuleSet, FileRules};
pub use permission::{
    AccessType, ContextualRule, FileAction, MatchMode, Permission, SecurityPermission, StackEntry,
    StackPosition, FILE_PERMISSION, RUNTIME_PERMISSION,
};

use crate::loader::LoaderEnhancer;
use crate::stack::AccessStack;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Package every policy implicitly allows
pub const ROOT_PACKAGE: &str = "core";

/// How the monitor measures elapsed run time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeMode {
    /// CPU time consumed by the sandboxed thread
    #[default]
    CpuTime,
    /// Wall-clock time since the execution was registered
    WallClock,
}

/// Execution strategy and limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Dispatch to the worker pool when one is configured
    pub run_remote: bool,

    /// Run on a dedicated, monitored thread
    pub run_in_thread: bool,

    /// Kill once the captured stack reaches this many frames
    pub max_stack_depth: Option<usize>,

    /// Kill once this much time has been spent
    pub max_run_time: Option<Duration>,

    pub runtime_mode: RuntimeMode,
}

/// Allow and deny rules for class or package names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRules {
    allow_exact: BTreeSet<String>,
    allow_prefix: BTreeSet<String>,
    deny_exact: BTreeSet<String>,
    deny_prefix: BTreeSet<String>,
    contextual: BTreeSet<ContextualRule>,
}

impl NameRules {
    /// An allow rule must match; then no deny rule may.
    #[must_use]
    pub fn check(&self, name: &str, stack: &AccessStack) -> bool {
        let allowed = self.allow_exact.contains(name)
            || self.allow_prefix.iter().any(|p| name.starts_with(p.as_str()))
            || self.contextual.iter().any(|r| r.allows(name, stack));
        if !allowed {
            return false;
        }
        !(self.deny_exact.contains(name) || self.deny_prefix.iter().any(|p| name.starts_with(p.as_str())))
    }

    pub fn insert(&mut self, access: AccessType, mode: MatchMode, name: impl Into<String>) {
        let name = name.into();
        let prefix = mode == MatchMode::Prefix || name.ends_with('.');
        let set = match (access, prefix) {
            (AccessType::Permit, false) => &mut self.allow_exact,
            (AccessType::Permit, true) => &mut self.allow_prefix,
            (AccessType::Deny, false) => &mut self.deny_exact,
            (AccessType::Deny, true) => &mut self.deny_prefix,
        };
        set.insert(name);
    }

    pub fn insert_contextual(&mut self, rule: ContextualRule) {
        self.contextual.insert(rule);
    }

    fn absorb(&mut self, other: &Self) {
        self.allow_exact.extend(other.allow_exact.iter().cloned());
        self.allow_prefix.extend(other.allow_prefix.iter().cloned());
        self.deny_exact.extend(other.deny_exact.iter().cloned());
        self.deny_prefix.extend(other.deny_prefix.iter().cloned());
        self.contextual.extend(other.contextual.iter().cloned());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allow_exact.len()
            + self.allow_prefix.len()
            + self.deny_exact.len()
            + self.deny_prefix.len()
            + self.contextual.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which units a loader hands to the parent domain and which it keeps inside
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderSettings {
    pub parent_units: BTreeSet<String>,
    pub parent_prefixes: BTreeSet<String>,
    pub parent_archives: BTreeSet<String>,
    pub sandbox_units: BTreeSet<String>,
    pub sandbox_prefixes: BTreeSet<String>,

    /// Strip lifecycle finalizers from units defined inside the sandbox
    pub remove_finalizers: bool,

    /// Label used as the loading domain's identity
    pub codesource: Option<String>,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            parent_units: BTreeSet::new(),
            parent_prefixes: BTreeSet::new(),
            parent_archives: BTreeSet::new(),
            sandbox_units: BTreeSet::new(),
            sandbox_prefixes: BTreeSet::new(),
            remove_finalizers: true,
            codesource: None,
        }
    }
}

impl LoaderSettings {
    fn absorb(&mut self, other: &Self) {
        self.parent_units.extend(other.parent_units.iter().cloned());
        self.parent_prefixes.extend(other.parent_prefixes.iter().cloned());
        self.parent_archives.extend(other.parent_archives.iter().cloned());
        self.sandbox_units.extend(other.sandbox_units.iter().cloned());
        self.sandbox_prefixes.extend(other.sandbox_prefixes.iter().cloned());
        self.remove_finalizers = other.remove_finalizers;
        self.codesource.clone_from(&other.codesource);
    }
}

/// Routing from unit names to nested sub-policies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routes {
    pub by_name: BTreeMap<String, PolicyId>,
    pub by_prefix: BTreeMap<String, PolicyId>,
    pub by_archive: BTreeMap<String, PolicyId>,
}

impl Routes {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.by_prefix.is_empty() && self.by_archive.is_empty()
    }

    pub fn targets(&self) -> impl Iterator<Item = PolicyId> + '_ {
        self.by_name
            .values()
            .chain(self.by_prefix.values())
            .chain(self.by_archive.values())
            .copied()
    }
}

/// Access rules and execution limits for one sandboxed scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    name: String,
    debug: bool,
    pass_all: bool,
    bypass_class_checks: bool,
    bypass_package_checks: bool,
    bypass_permission_checks: bool,
    limits: ExecutionLimits,
    classes: NameRules,
    packages: NameRules,
    permission_allow: BTreeMap<String, BTreeSet<SecurityPermission>>,
    permission_deny: BTreeMap<String, BTreeSet<SecurityPermission>>,
    files: FileRules,
    trusted_archives: BTreeSet<String>,
    loading: LoaderSettings,
    pub(crate) routes: Routes,
    #[serde(skip)]
    enhancer: Option<Arc<dyn LoaderEnhancer>>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            name: String::new(),
            debug: false,
            pass_all: false,
            bypass_class_checks: false,
            bypass_package_checks: true,
            bypass_permission_checks: false,
            limits: ExecutionLimits::default(),
            classes: NameRules::default(),
            packages: NameRules::default(),
            permission_allow: BTreeMap::new(),
            permission_deny: BTreeMap::new(),
            files: FileRules::default(),
            trusted_archives: BTreeSet::new(),
            loading: LoaderSettings::default(),
            routes: Routes::default(),
            enhancer: None,
        }
    }
}

impl PermissionPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Freeze a standalone policy. Routes need an arena and are dropped.
    #[must_use]
    pub fn freeze(self) -> PolicyHandle {
        PolicyArena::single(self)
    }

    // Checks

    #[must_use]
    pub fn check_class_access(&self, name: &str, stack: &AccessStack) -> bool {
        self.pass_all || self.classes.check(name, stack)
    }

    #[must_use]
    pub fn check_package_access(&self, package: &str, stack: &AccessStack) -> bool {
        self.pass_all || package == ROOT_PACKAGE || self.packages.check(package, stack)
    }

    /// Deny rules first, file requests by action, then allow rules.
    #[must_use]
    pub fn check_permission(&self, request: &Permission, stack: &AccessStack) -> bool {
        if self.pass_all {
            return true;
        }
        if self
            .permission_deny
            .get(request.kind())
            .is_some_and(|rules| rules.iter().any(|r| r.matches(request, stack)))
        {
            return false;
        }

        if let Some((action, path)) = request.file_action() {
            return self.check_file_action(action, path);
        }

        self.permission_allow
            .get(request.kind())
            .is_some_and(|rules| rules.iter().any(|r| r.matches(request, stack)))
    }

    #[must_use]
    pub fn check_file_action(&self, action: FileAction, path: &str) -> bool {
        self.pass_all || self.files.get(action).check(path)
    }

    // Rule mutators

    /// Names ending in `.` are always prefix rules.
    pub fn add_class_permission(&mut self, access: AccessType, mode: MatchMode, name: impl Into<String>) -> &mut Self {
        self.classes.insert(access, mode, name);
        self
    }

    pub fn add_package_permission(&mut self, access: AccessType, mode: MatchMode, name: impl Into<String>) -> &mut Self {
        self.packages.insert(access, mode, name);
        self
    }

    pub fn allow_class(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_class_permission(AccessType::Permit, MatchMode::Exact, name)
    }

    pub fn deny_class(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_class_permission(AccessType::Deny, MatchMode::Exact, name)
    }

    pub fn allow_class_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.add_class_permission(AccessType::Permit, MatchMode::Prefix, prefix)
    }

    pub fn deny_class_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.add_class_permission(AccessType::Deny, MatchMode::Prefix, prefix)
    }

    pub fn allow_package(&mut self, package: impl Into<String>) -> &mut Self {
        self.add_package_permission(AccessType::Permit, MatchMode::Prefix, package)
    }

    pub fn deny_package(&mut self, package: impl Into<String>) -> &mut Self {
        self.add_package_permission(AccessType::Deny, MatchMode::Prefix, package)
    }

    pub fn add_contextual_class_rule(&mut self, rule: ContextualRule) -> &mut Self {
        self.classes.insert_contextual(rule);
        self
    }

    /// Adding a contextual package rule switches package checks on.
    pub fn add_contextual_package_rule(&mut self, rule: ContextualRule) -> &mut Self {
        self.packages.insert_contextual(rule);
        self.bypass_package_checks = false;
        self
    }

    pub fn add_permission(&mut self, access: AccessType, permission: SecurityPermission) -> &mut Self {
        let map = match access {
            AccessType::Permit => &mut self.permission_allow,
            AccessType::Deny => &mut self.permission_deny,
        };
        map.entry(permission.kind().to_string()).or_default().insert(permission);
        self
    }

    pub fn add_file_permission(&mut self, access: AccessType, action: FileAction, rule: FileRule) -> &mut Self {
        self.files.get_mut(action).insert(access, rule);
        self
    }

    /// Returns whether the rule was present.
    pub fn remove_file_permission(&mut self, access: AccessType, action: FileAction, rule: &FileRule) -> bool {
        self.files.get_mut(action).remove(access, rule)
    }

    /// Read, write and delete below the system temporary directory.
    pub fn allow_temp_dir(&mut self) -> &mut Self {
        let rule = dir_rule(&std::env::temp_dir());
        for action in FileAction::ALL {
            self.add_file_permission(AccessType::Permit, action, rule.clone());
        }
        self
    }

    /// Read below the current working directory.
    pub fn allow_work_dir(&mut self) -> &mut Self {
        match std::env::current_dir() {
            Ok(dir) => {
                self.add_file_permission(AccessType::Permit, FileAction::Read, dir_rule(&dir));
            }
            Err(e) => tracing::warn!(error = %e, "working directory unavailable, no rule added"),
        }
        self
    }

    pub fn add_trusted_archive(&mut self, archive: impl Into<String>) -> &mut Self {
        self.trusted_archives.insert(archive.into());
        self
    }

    /// Resolve through the parent domain; names ending in `.` are prefixes.
    pub fn load_with_parent(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        if name.ends_with('.') {
            self.loading.parent_prefixes.insert(name);
        } else {
            self.loading.parent_units.insert(name);
        }
        self
    }

    pub fn load_archive_with_parent(&mut self, archive: impl Into<String>) -> &mut Self {
        self.loading.parent_archives.insert(archive.into());
        self
    }

    /// Force inside the sandbox even when otherwise resolved by the parent.
    pub fn load_inside(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        if name.ends_with('.') {
            self.loading.sandbox_prefixes.insert(name);
        } else {
            self.loading.sandbox_units.insert(name);
        }
        self
    }

    // Scalar settings

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub const fn set_debug(&mut self, debug: bool) -> &mut Self {
        self.debug = debug;
        self
    }

    pub const fn set_pass_all(&mut self, pass_all: bool) -> &mut Self {
        self.pass_all = pass_all;
        self
    }

    pub const fn set_bypass_class_checks(&mut self, bypass: bool) -> &mut Self {
        self.bypass_class_checks = bypass;
        self
    }

    pub const fn set_bypass_package_checks(&mut self, bypass: bool) -> &mut Self {
        self.bypass_package_checks = bypass;
        self
    }

    pub const fn set_bypass_permission_checks(&mut self, bypass: bool) -> &mut Self {
        self.bypass_permission_checks = bypass;
        self
    }

    pub const fn set_run_remote(&mut self, remote: bool) -> &mut Self {
        self.limits.run_remote = remote;
        self
    }

    pub const fn set_run_in_thread(&mut self, in_thread: bool) -> &mut Self {
        self.limits.run_in_thread = in_thread;
        self
    }

    pub const fn set_max_stack_depth(&mut self, depth: Option<usize>) -> &mut Self {
        self.limits.max_stack_depth = depth;
        self
    }

    pub const fn set_max_run_time(&mut self, limit: Option<Duration>, mode: RuntimeMode) -> &mut Self {
        self.limits.max_run_time = limit;
        self.limits.runtime_mode = mode;
        self
    }

    pub const fn set_remove_finalizers(&mut self, remove: bool) -> &mut Self {
        self.loading.remove_finalizers = remove;
        self
    }

    pub fn set_codesource(&mut self, label: impl Into<String>) -> &mut Self {
        self.loading.codesource = Some(label.into());
        self
    }

    pub fn set_enhancer(&mut self, enhancer: Arc<dyn LoaderEnhancer>) -> &mut Self {
        self.enhancer = Some(enhancer);
        self
    }

    // Accessors

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.debug
    }

    #[must_use]
    pub const fn is_pass_all(&self) -> bool {
        self.pass_all
    }

    #[must_use]
    pub const fn bypass_class_checks(&self) -> bool {
        self.bypass_class_checks
    }

    #[must_use]
    pub const fn bypass_package_checks(&self) -> bool {
        self.bypass_package_checks
    }

    #[must_use]
    pub const fn bypass_permission_checks(&self) -> bool {
        self.bypass_permission_checks
    }

    #[must_use]
    pub const fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    #[must_use]
    pub const fn classes(&self) -> &NameRules {
        &self.classes
    }

    #[must_use]
    pub const fn packages(&self) -> &NameRules {
        &self.packages
    }

    #[must_use]
    pub const fn files(&self) -> &FileRules {
        &self.files
    }

    #[must_use]
    pub fn permission_rule_count(&self) -> usize {
        self.permission_allow.values().chain(self.permission_deny.values()).map(BTreeSet::len).sum()
    }

    #[must_use]
    pub const fn trusted_archives(&self) -> &BTreeSet<String> {
        &self.trusted_archives
    }

    #[must_use]
    pub const fn loading(&self) -> &LoaderSettings {
        &self.loading
    }

    #[must_use]
    pub const fn routes(&self) -> &Routes {
        &self.routes
    }

    #[must_use]
    pub fn enhancer(&self) -> Option<&Arc<dyn LoaderEnhancer>> {
        self.enhancer.as_ref()
    }

    /// Copy every rule set from `other` and take over its scalar settings.
    /// Routes are handled by the arena.
    pub(crate) fn absorb(&mut self, other: &Self) {
        self.name.clone_from(&other.name);
        self.debug = other.debug;
        self.pass_all = other.pass_all;
        self.bypass_class_checks = other.bypass_class_checks;
        self.bypass_package_checks = other.bypass_package_checks;
        self.bypass_permission_checks = other.bypass_permission_checks;
        self.limits = other.limits.clone();
        self.classes.absorb(&other.classes);
        self.packages.absorb(&other.packages);
        for (kind, rules) in &other.permission_allow {
            self.permission_allow.entry(kind.clone()).or_default().extend(rules.iter().cloned());
        }
        for (kind, rules) in &other.permission_deny {
            self.permission_deny.entry(kind.clone()).or_default().extend(rules.iter().cloned());
        }
        self.files.absorb(&other.files);
        self.trusted_archives.extend(other.trusted_archives.iter().cloned());
        self.loading.absorb(&other.loading);
        self.enhancer.clone_from(&other.enhancer);
    }
}

fn dir_rule(dir: &Path) -> FileRule {
    let mut prefix = dir.to_string_lossy().into_owned();
    if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
        prefix.push(std::path::MAIN_SEPARATOR);
    }
    FileRule::prefix(prefix)
}
