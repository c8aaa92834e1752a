mod common;

use common::FakeSpawner;
use palisade_core::policy::{AccessType, FileAction, FileRule, RuntimeMode};
use palisade_core::pool::WorkerPool;
use palisade_core::{
    Argument, BadKillReport, Bridge, CoordinatorConfig, DomainId, ExecutionCoordinator, HostDomain, PalisadeError,
    PermissionPolicy, PolicyHandle, PoolConfig, Result, SandboxObserver, SandboxedUnit, UnitDefinition, UnitEnv,
    Value,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Calls the unit named by its first argument.
struct Launcher(String);

impl SandboxedUnit for Launcher {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        env.call(&self.0, &[])
    }
}

struct Constant(&'static str);

impl SandboxedUnit for Constant {
    fn execute(&mut self, _env: &mut UnitEnv<'_>) -> Result<Value> {
        Ok(json!(self.0))
    }
}

/// Busy-loops for a second, checking for cancellation.
struct Spin {
    critical: bool,
}

impl SandboxedUnit for Spin {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        let _section = self.critical.then(|| env.critical_section());
        let start = Instant::now();
        let mut n: u64 = 0;
        while start.elapsed() < Duration::from_secs(1) {
            n = n.wrapping_add(1);
            if n % 1024 == 0 {
                env.checkpoint()?;
            }
        }
        Ok(json!("finished"))
    }
}

/// Recurses into itself forever.
struct Deep;

impl SandboxedUnit for Deep {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        std::thread::sleep(Duration::from_millis(1));
        env.call("app.Deep", &[])
    }
}

/// Starts a thread that nests frames and waits to be stopped. Reports
/// whether the thread was killed.
struct Forking;

impl SandboxedUnit for Forking {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        let child = env.spawn("app-forked", |env| {
            let _frames: Vec<_> = (0..5).map(|i| env.enter_frame(format!("app.Nested{i}"))).collect();
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(2) {
                env.checkpoint()?;
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(json!("finished"))
        })?;
        let outcome = child
            .join()
            .map_err(|_| PalisadeError::unit_failure("forked thread panicked"))?;
        Ok(json!(matches!(outcome, Err(PalisadeError::Killed { .. }))))
    }
}

/// Writes its second argument to the path in its first.
struct Writer(String);

impl SandboxedUnit for Writer {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value> {
        env.write_file(&self.0, b"data")?;
        Ok(json!(true))
    }
}

struct Echo(Value);

impl SandboxedUnit for Echo {
    fn execute(&mut self, _env: &mut UnitEnv<'_>) -> Result<Value> {
        Ok(self.0.clone())
    }
}

fn first_string(args: &[Argument]) -> String {
    args.first()
        .and_then(|a| a.value().as_str())
        .unwrap_or_default()
        .to_string()
}

fn host() -> Arc<HostDomain> {
    let host = HostDomain::new();
    host.register(UnitDefinition::new("app.safe.Launcher").with_entry(|args: &[Argument]| Ok(Launcher(first_string(args)))))
        .register(UnitDefinition::new("app.safe.Ok").with_entry(|_: &[Argument]| Ok(Constant("ok"))))
        .register(UnitDefinition::new("app.safe.Danger").with_entry(|_: &[Argument]| Ok(Constant("danger"))))
        .register(UnitDefinition::new("app.Spin").with_entry(|_: &[Argument]| Ok(Spin { critical: false })))
        .register(UnitDefinition::new("app.CriticalSpin").with_entry(|_: &[Argument]| Ok(Spin { critical: true })))
        .register(UnitDefinition::new("app.Deep").with_entry(|_: &[Argument]| Ok(Deep)))
        .register(UnitDefinition::new("app.Forking").with_entry(|_: &[Argument]| Ok(Forking)))
        .register(UnitDefinition::new("app.Writer").with_entry(|args: &[Argument]| Ok(Writer(first_string(args)))))
        .register(
            UnitDefinition::new("app.Echo")
                .with_entry(|args: &[Argument]| Ok(Echo(args.first().map_or(Value::Null, |a| a.value().clone())))),
        );
    Arc::new(host)
}

fn coordinator() -> ExecutionCoordinator {
    ExecutionCoordinator::new(host(), CoordinatorConfig::default()).expect("coordinator")
}

fn safe_only() -> PolicyHandle {
    let mut policy = PermissionPolicy::new("safe-only");
    policy.allow_class_prefix("app.safe.").deny_class("app.safe.Danger");
    policy.freeze()
}

fn open(configure: impl FnOnce(&mut PermissionPolicy)) -> PolicyHandle {
    let mut policy = PermissionPolicy::new("open");
    policy.set_pass_all(true);
    configure(&mut policy);
    policy.freeze()
}

#[test]
fn denied_unit_is_refused_and_allowed_unit_runs() {
    let coordinator = coordinator();
    let policy = safe_only();

    let denied = coordinator.run_sandboxed("app.safe.Launcher", &policy, &[Argument::new("app.safe.Danger")]);
    assert!(matches!(denied, Err(PalisadeError::AccessDenied { request }) if request.contains("app.safe.Danger")));

    let allowed = coordinator
        .run_sandboxed("app.safe.Launcher", &policy, &[Argument::new("app.safe.Ok")])
        .expect("allowed");
    assert_eq!(allowed.raw(), &json!("ok"));
}

#[test]
fn in_context_runs_skip_enforcement() {
    let coordinator = coordinator();
    let result = coordinator
        .run_in_context("app.safe.Launcher", &safe_only(), &[Argument::new("app.safe.Danger")])
        .expect("trusted run");
    assert_eq!(result.raw(), &json!("danger"));
}

#[test]
fn runaway_thread_is_killed_after_its_time_limit() {
    let coordinator = coordinator();
    let policy = open(|p| {
        p.set_run_in_thread(true)
            .set_max_run_time(Some(Duration::from_millis(50)), RuntimeMode::WallClock);
    });

    let start = Instant::now();
    let outcome = coordinator.run_sandboxed("app.Spin", &policy, &[]);
    let elapsed = start.elapsed();
    assert!(matches!(outcome, Err(PalisadeError::Killed { .. })), "got {outcome:?}");
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(900), "took {elapsed:?}");
}

#[test]
fn cpu_time_limit_also_kills() {
    let coordinator = coordinator();
    let policy = open(|p| {
        p.set_run_in_thread(true)
            .set_max_run_time(Some(Duration::from_millis(50)), RuntimeMode::CpuTime);
    });
    assert!(matches!(
        coordinator.run_sandboxed("app.Spin", &policy, &[]),
        Err(PalisadeError::Killed { .. })
    ));
}

#[test]
fn stack_depth_limit_stops_recursion() {
    let coordinator = coordinator();
    let policy = open(|p| {
        p.set_run_in_thread(true).set_max_stack_depth(Some(20));
    });
    assert!(matches!(
        coordinator.run_sandboxed("app.Deep", &policy, &[]),
        Err(PalisadeError::Killed { .. })
    ));
}

#[test]
fn threads_started_by_a_monitored_unit_are_monitored_too() {
    let coordinator = coordinator();
    let policy = open(|p| {
        p.set_run_in_thread(true).set_max_stack_depth(Some(3));
    });
    let started = Instant::now();
    let result = coordinator.run_sandboxed("app.Forking", &policy, &[]).expect("parent survives");
    assert_eq!(result.raw(), &json!(true));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[derive(Default)]
struct Recorder {
    bad_kills: AtomicUsize,
    contexts: parking_lot::Mutex<Vec<String>>,
}

impl SandboxObserver for Recorder {
    fn bad_kill(&self, report: &BadKillReport) {
        assert!(report.held_sections > 0);
        self.bad_kills.fetch_add(1, Ordering::SeqCst);
    }

    fn context_registered(&self, name: &str, _policy: &PolicyHandle) {
        self.contexts.lock().push(name.to_string());
    }
}

#[test]
fn kill_inside_a_critical_section_is_reported_but_looks_like_any_kill() {
    let coordinator = coordinator();
    let recorder = Arc::new(Recorder::default());
    coordinator.attach_observer(recorder.clone());
    let policy = open(|p| {
        p.set_run_in_thread(true)
            .set_max_run_time(Some(Duration::from_millis(30)), RuntimeMode::WallClock);
    });

    let outcome = coordinator.run_sandboxed("app.CriticalSpin", &policy, &[]);
    assert!(matches!(outcome, Err(PalisadeError::Killed { .. })));
    // The report is delivered by the monitor thread, possibly after the caller returned.
    let deadline = Instant::now() + Duration::from_secs(1);
    while recorder.bad_kills.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(recorder.bad_kills.load(Ordering::SeqCst), 1);

    let outcome = coordinator.run_sandboxed("app.Spin", &policy, &[]);
    assert!(matches!(outcome, Err(PalisadeError::Killed { .. })));
    assert_eq!(recorder.bad_kills.load(Ordering::SeqCst), 1);
}

#[test]
fn registered_contexts_notify_observers_and_serve_name_lookups() {
    let coordinator = coordinator();
    let recorder = Arc::new(Recorder::default());
    coordinator.attach_observer(recorder.clone());
    coordinator.register_context("safe", safe_only());

    assert_eq!(*recorder.contexts.lock(), ["safe"]);
    let result = coordinator
        .run_sandboxed_in("safe", "app.safe.Ok", &[])
        .expect("named context");
    assert_eq!(result.raw(), &json!("ok"));
}

#[test]
fn file_access_follows_the_file_rules() {
    let dir = tempfile::tempdir().expect("tempdir");
    let allowed_dir = dir.path().join("out");
    std::fs::create_dir(&allowed_dir).expect("mkdir");
    let allowed = allowed_dir.join("result.txt");
    let forbidden = dir.path().join("elsewhere.txt");

    let coordinator = coordinator();
    let mut policy = PermissionPolicy::new("writer");
    policy.allow_class("app.Writer").add_file_permission(
        AccessType::Permit,
        FileAction::Write,
        FileRule::prefix(format!("{}/", allowed_dir.display())),
    );
    let policy = policy.freeze();

    coordinator
        .run_sandboxed("app.Writer", &policy, &[Argument::new(allowed.display().to_string())])
        .expect("allowed write");
    assert_eq!(std::fs::read(&allowed).expect("written"), b"data");

    let denied = coordinator.run_sandboxed("app.Writer", &policy, &[Argument::new(forbidden.display().to_string())]);
    assert!(matches!(denied, Err(PalisadeError::AccessDenied { .. })));
    assert!(!forbidden.exists());
}

struct Tagging;

impl Bridge for Tagging {
    fn bridge(&self, value: Value, target: &DomainId) -> Result<Value> {
        Ok(json!({ "value": value, "domain": target.as_str() }))
    }
}

#[test]
fn typed_arguments_are_bridged_into_the_unit_domain() {
    let coordinator = coordinator().with_bridge(Arc::new(Tagging));
    let policy = open(|_| {});
    let loader = coordinator.init_loader(&policy);

    let result = coordinator
        .run_sandboxed_with("app.Echo", &loader, &[Argument::typed(json!(5), "demo.Number")])
        .expect("echo");
    assert_eq!(result.raw()["value"], json!(5));
    assert_eq!(result.raw()["domain"], json!(loader.domain_id().as_str()));

    let plain = coordinator
        .run_sandboxed_with("app.Echo", &loader, &[Argument::new(5)])
        .expect("echo");
    assert_eq!(plain.raw(), &json!(5));
    // Same domain: no bridging on the way out.
    assert_eq!(plain.get(coordinator.bridge_handle().as_ref(), loader.domain_id()).expect("get"), json!(5));
}

#[test]
fn remote_policies_go_through_the_pool() {
    let spawner = FakeSpawner::new();
    let config = PoolConfig::builder().pool_size(1).freelancers(0).build();
    let pool = WorkerPool::with_spawner(config, Arc::new(spawner.clone())).expect("pool");
    let pooled = coordinator().with_pool(Arc::new(pool));
    let policy = open(|p| {
        p.set_run_remote(true);
    });

    let result = pooled.run_sandboxed("app.safe.Ok", &policy, &[]).expect("remote");
    assert_eq!(result.origin().as_str(), "Nr1");
    assert_eq!(spawner.world.log(), ["1:app.safe.Ok"]);

    // Without a pool the same policy runs locally.
    let result = coordinator().run_sandboxed("app.safe.Ok", &policy, &[]).expect("local");
    assert_eq!(result.raw(), &json!("ok"));
}

#[test]
fn remote_coordinators_never_redispatch() {
    let coordinator = ExecutionCoordinator::new(host(), CoordinatorConfig::remote()).expect("coordinator");
    let spawner = FakeSpawner::new();
    let config = PoolConfig::builder().pool_size(1).freelancers(0).build();
    let coordinator =
        coordinator.with_pool(Arc::new(WorkerPool::with_spawner(config, Arc::new(spawner.clone())).expect("pool")));
    let policy = open(|p| {
        p.set_run_remote(true);
    });

    let result = coordinator.run_sandboxed("app.safe.Ok", &policy, &[]).expect("local");
    assert_eq!(result.raw(), &json!("ok"));
    assert!(spawner.world.log().is_empty());
}

#[test]
fn freelancers_require_a_pool() {
    assert!(matches!(coordinator().acquire_freelancer(), Err(PalisadeError::Config(_))));
}
