use palisade_core::loader::UnitOrigin;
use palisade_core::policy::{PolicyArena, RouteKey};
use palisade_core::{
    Argument, CodeArchive, CodeLoader, DomainId, EnforcementContext, HostDomain, LoadedUnit, LoaderEnhancer,
    PalisadeError, PermissionPolicy, PolicyHandle, Result, SandboxedUnit, UnitDefinition, UnitEnv, Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Nothing;

impl SandboxedUnit for Nothing {
    fn execute(&mut self, _env: &mut UnitEnv<'_>) -> Result<Value> {
        Ok(Value::Null)
    }
}

fn unit(name: &str) -> UnitDefinition {
    UnitDefinition::new(name).with_entry(|_: &[Argument]| Ok(Nothing))
}

fn host(names: &[&str]) -> Arc<HostDomain> {
    let host = HostDomain::new();
    for name in names {
        host.register(unit(name).with_bytes(name.as_bytes()));
    }
    Arc::new(host)
}

fn open() -> PolicyHandle {
    let mut policy = PermissionPolicy::new("open");
    policy.set_pass_all(true);
    policy.freeze()
}

#[test]
fn loading_twice_returns_the_same_unit() {
    let loader = CodeLoader::new(&open(), host(&["app.Main"]));
    let ctx = EnforcementContext::new();
    let first = loader.load("app.Main", &ctx).expect("load");
    let second = loader.load("app.Main", &ctx).expect("load");
    assert!(Arc::ptr_eq(&first, &second));
    assert!(loader.is_loaded("app.Main"));
}

#[test]
fn sandboxed_units_live_in_the_loader_domain() {
    let mut policy = PermissionPolicy::new("split");
    policy.set_pass_all(true).load_with_parent("shared.");
    let loader = CodeLoader::new(&policy.freeze(), host(&["app.Main", "shared.Api", "core.Text"]));
    let ctx = EnforcementContext::new();

    let inside = loader.load("app.Main", &ctx).expect("inside");
    assert_eq!(inside.origin(), &UnitOrigin::Sandbox);
    assert_eq!(inside.domain(), loader.domain_id());
    assert_eq!(inside.bytes(), b"app.Main");

    let shared = loader.load("shared.Api", &ctx).expect("parent");
    assert_eq!(shared.origin(), &UnitOrigin::Parent);
    assert_eq!(shared.domain(), &DomainId::host());

    // Trusted namespaces always resolve through the parent.
    assert_eq!(loader.load("core.Text", &ctx).expect("core").origin(), &UnitOrigin::Parent);
}

#[test]
fn load_inside_overrides_parent_prefixes() {
    let mut policy = PermissionPolicy::new("split");
    policy
        .set_pass_all(true)
        .load_with_parent("shared.")
        .load_inside("shared.Mutable");
    let loader = CodeLoader::new(&policy.freeze(), host(&["shared.Api", "shared.Mutable"]));
    let ctx = EnforcementContext::new();
    assert_eq!(loader.load("shared.Api", &ctx).expect("api").origin(), &UnitOrigin::Parent);
    assert_eq!(loader.load("shared.Mutable", &ctx).expect("mutable").origin(), &UnitOrigin::Sandbox);
}

#[test]
fn unknown_units_are_not_found() {
    let loader = CodeLoader::new(&open(), host(&[]));
    let missing = loader.load("app.Missing", &EnforcementContext::new());
    assert!(matches!(missing, Err(PalisadeError::ResolutionNotFound { name, .. }) if name == "app.Missing"));
}

#[test]
fn denied_units_are_checked_on_load_and_trusted_archives_skip_checks() {
    let host = HostDomain::new();
    host.register(unit("app.Main"))
        .register_archive(CodeArchive::new("stdlib").with_unit(unit("lib.Util")));
    let mut policy = PermissionPolicy::new("closed");
    policy.add_trusted_archive("stdlib");
    let policy = policy.freeze();
    let loader = CodeLoader::new(&policy, Arc::new(host));

    let ctx = EnforcementContext::new();
    let token = ctx.arm_new(policy).expect("arm");
    assert!(matches!(
        loader.load("app.Main", &ctx),
        Err(PalisadeError::AccessDenied { .. })
    ));
    assert!(!loader.is_loaded("app.Main"));

    let util = loader.load("lib.Util", &ctx).expect("trusted");
    assert!(util.is_trusted());
    ctx.disarm(&token).expect("disarm");
}

#[test]
fn routed_units_load_in_their_nested_domain() {
    let mut arena = PolicyArena::new();
    let mut root = PermissionPolicy::new("root");
    root.set_pass_all(true);
    let root = arena.insert(root);
    let mut plugins = PermissionPolicy::new("plugins");
    plugins.set_pass_all(true);
    let plugins = arena.insert(plugins);
    arena.route(root, RouteKey::Prefix("plugin.".into()), plugins);

    let loader = CodeLoader::new(&arena.freeze(root), host(&["app.Main", "plugin.Chart"]));
    let ctx = EnforcementContext::new();
    let nested = loader.nested_loader_for("plugin.Chart").expect("nested");
    assert_eq!(nested.policy().name(), "plugins");
    assert!(loader.nested_loader_for("app.Main").is_none());

    let chart = loader.load("plugin.Chart", &ctx).expect("chart");
    assert_eq!(chart.domain(), nested.domain_id());
    assert_ne!(chart.domain(), loader.domain_id());
    assert!(nested.is_loaded("plugin.Chart"));
    assert!(!loader.is_loaded("plugin.Chart"));

    let found = loader.find_by_name("plugins").expect("found");
    assert!(found.same_loader(&nested));
    assert!(loader.find_by_name("missing").is_none());
}

#[test]
fn finalizers_are_stripped_unless_disabled() {
    let runs = Arc::new(AtomicUsize::new(0));
    let host = HostDomain::new();
    let counter = Arc::clone(&runs);
    host.register(unit("app.Closer").with_finalizer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let host = Arc::new(host);
    let ctx = EnforcementContext::new();

    let loader = CodeLoader::new(&open(), host.clone());
    let stripped = loader.load("app.Closer", &ctx).expect("load");
    assert!(!stripped.has_finalizer());
    drop((stripped, loader));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let mut keep = PermissionPolicy::new("keep");
    keep.set_pass_all(true).set_remove_finalizers(false);
    let loader = CodeLoader::new(&keep.freeze(), host);
    let kept = loader.load("app.Closer", &ctx).expect("load");
    assert!(kept.has_finalizer());
    drop((kept, loader));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<String>>,
}

impl LoaderEnhancer for Recording {
    fn before_load(&self, _loader: &CodeLoader, name: &str) {
        self.seen.lock().push(name.to_string());
    }

    fn fallback_definition(&self, _loader: &CodeLoader, name: &str) -> Option<UnitDefinition> {
        name.starts_with("generated.").then(|| unit(name))
    }

    fn enhance(&self, _loader: &CodeLoader, _name: &str, mut bytes: Vec<u8>) -> Vec<u8> {
        bytes.extend_from_slice(b"+enhanced");
        bytes
    }

    fn after_load(&self, _loader: &CodeLoader, _name: &str, _unit: &Arc<LoadedUnit>) {}
}

#[test]
fn enhancer_hooks_shape_sandboxed_units() {
    let enhancer = Arc::new(Recording::default());
    let mut policy = PermissionPolicy::new("enhanced");
    policy.set_pass_all(true).set_enhancer(enhancer.clone());
    let loader = CodeLoader::new(&policy.freeze(), host(&["app.Main"]));
    let ctx = EnforcementContext::new();

    assert_eq!(loader.load("app.Main", &ctx).expect("main").bytes(), b"app.Main+enhanced");
    assert!(loader.load("app.Main", &ctx).is_ok());
    assert!(loader.load("generated.Proxy", &ctx).is_ok());
    assert!(loader.load("other.Missing", &ctx).is_err());
    assert_eq!(*enhancer.seen.lock(), ["app.Main", "generated.Proxy", "other.Missing"]);
}

#[test]
fn defined_units_join_the_loader_cache() {
    let loader = CodeLoader::new(&open(), host(&[]));
    let defined = loader.define(unit("dyn.Script"), true).expect("define");
    assert_eq!(defined.origin(), &UnitOrigin::Sandbox);
    let again = loader.load("dyn.Script", &EnforcementContext::new()).expect("cached");
    assert!(Arc::ptr_eq(&defined, &again));
}
