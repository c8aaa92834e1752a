//! Top-level entry point for running units under a policy
//!
//! `run` picks one of three strategies from the policy's limits:
//! 1. remote: submit a task to the worker pool and wait for its future
//! 2. own thread: run on a fresh thread registered with the monitor
//! 3. inline: run on the calling thread
//!
//! In `Sandboxed` mode enforcement is armed around the call; `InContext`
//! runs trusted, without checks.

use crate::config::CoordinatorConfig;
use crate::enforcer::EnforcementContext;
use crate::exec::{ExecutionState, FrameGuard, KillRecord};
use crate::loader::{CodeLoader, ParentDomain};
use crate::monitor::{MonitorService, MonitoredExecution, SandboxObserver};
use crate::policy::{PolicyHandle, PolicyId};
use crate::pool::{Freelancer, SandboxTask, WorkerPool};
use crate::registry::PolicyRegistry;
use crate::result::{Bridge, DomainId, PassthroughBridge, SandboxedCallResult, Value};
use crate::unit::{Argument, UnitEnv};
use crate::{PalisadeError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;

static NEXT_SANDBOXED_THREAD: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Trusted call, enforcement stays disarmed
    InContext,
    /// Enforcement armed with the loader's policy
    Sandboxed,
}

pub struct ExecutionCoordinator {
    domain: Arc<dyn ParentDomain>,
    registry: Arc<PolicyRegistry>,
    monitor: MonitorService,
    pool: RwLock<Option<Arc<WorkerPool>>>,
    bridge: Arc<dyn Bridge>,
    loaders: Mutex<HashMap<(usize, PolicyId), CodeLoader>>,
    remote: bool,
}

impl ExecutionCoordinator {
    /// Start the monitor and, if configured, the worker pool.
    pub fn new(domain: Arc<dyn ParentDomain>, config: CoordinatorConfig) -> Result<Self> {
        let monitor = MonitorService::start(config.monitor)?;
        let pool = config.pool.map(WorkerPool::new).transpose()?.map(Arc::new);
        tracing::info!(remote = config.remote, pool = pool.is_some(), "execution coordinator started");
        Ok(Self {
            domain,
            registry: Arc::new(PolicyRegistry::new()),
            monitor,
            pool: RwLock::new(pool),
            bridge: Arc::new(PassthroughBridge),
            loaders: Mutex::new(HashMap::new()),
            remote: config.remote,
        })
    }

    #[must_use]
    pub fn with_pool(self, pool: Arc<WorkerPool>) -> Self {
        self.set_pool(Some(pool));
        self
    }

    #[must_use]
    pub fn with_bridge(mut self, bridge: Arc<dyn Bridge>) -> Self {
        self.bridge = bridge;
        self
    }

    /// Share a registry, e.g. between a runtime process's sessions.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the pool, returning the previous one.
    pub fn set_pool(&self, pool: Option<Arc<WorkerPool>>) -> Option<Arc<WorkerPool>> {
        std::mem::replace(&mut *self.pool.write(), pool)
    }

    #[must_use]
    pub fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.pool.read().clone()
    }

    /// Whether this coordinator runs inside a runtime process.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        self.remote
    }

    #[must_use]
    pub const fn monitor(&self) -> &MonitorService {
        &self.monitor
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn domain(&self) -> &Arc<dyn ParentDomain> {
        &self.domain
    }

    // Contexts and observers

    pub fn register_context(&self, name: &str, policy: PolicyHandle) {
        self.monitor.observers().notify(|o| o.context_registered(name, &policy));
        self.registry.register(name, policy);
    }

    #[must_use]
    pub fn context(&self, name: &str) -> Option<PolicyHandle> {
        self.registry.get(name)
    }

    fn require_context(&self, name: &str) -> Result<PolicyHandle> {
        self.context(name)
            .ok_or_else(|| PalisadeError::Config(format!("no context registered as {name}")))
    }

    pub fn attach_observer(&self, observer: Arc<dyn SandboxObserver>) {
        self.monitor.attach_observer(observer);
    }

    pub fn detach_observer(&self, observer: &Arc<dyn SandboxObserver>) -> bool {
        self.monitor.detach_observer(observer)
    }

    /// Loader for `policy`, built on first use and reused while the caller
    /// keeps a handle to the policy.
    ///
    /// A cached tree holds one handle per node of the frozen arena. Once those
    /// are the only handles left nobody can ask for that loader again, so the
    /// entry is dropped. Loaders already handed out keep working.
    pub fn init_loader(&self, policy: &PolicyHandle) -> CodeLoader {
        let mut loaders = self.loaders.lock();
        let key = (policy.arena_key(), policy.id());
        if let Some(loader) = loaders.get(&key) {
            return loader.clone();
        }
        loaders.retain(|_, loader| loader.policy().arena_refs() > loader.tree_len());

        let loader = CodeLoader::new(policy, Arc::clone(&self.domain));
        tracing::debug!(policy = policy.name(), loader = %loader.domain_id(), cached = loaders.len(), "loader initialized");
        loaders.insert(key, loader.clone());
        loader
    }

    /// Loader trees currently cached.
    #[must_use]
    pub fn cached_loaders(&self) -> usize {
        self.loaders.lock().len()
    }

    // Entry points

    pub fn run_sandboxed(&self, unit: &str, policy: &PolicyHandle, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.run(unit, &self.init_loader(policy), RunMode::Sandboxed, args)
    }

    pub fn run_in_context(&self, unit: &str, policy: &PolicyHandle, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.run(unit, &self.init_loader(policy), RunMode::InContext, args)
    }

    pub fn run_sandboxed_with(&self, unit: &str, loader: &CodeLoader, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.run(unit, loader, RunMode::Sandboxed, args)
    }

    pub fn run_in_context_with(&self, unit: &str, loader: &CodeLoader, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.run(unit, loader, RunMode::InContext, args)
    }

    /// Run under the policy registered as `context`.
    pub fn run_sandboxed_in(&self, context: &str, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult> {
        let policy = self.require_context(context)?;
        self.run_sandboxed(unit, &policy, args)
    }

    pub fn run_in_context_in(&self, context: &str, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult> {
        let policy = self.require_context(context)?;
        self.run_in_context(unit, &policy, args)
    }

    /// Run a task shipped from another process.
    pub fn execute_task(&self, task: &SandboxTask) -> Result<SandboxedCallResult> {
        self.run(task.unit(), &self.init_loader(task.policy()), task.mode(), task.args())
    }

    pub fn run(&self, unit: &str, loader: &CodeLoader, mode: RunMode, args: &[Argument]) -> Result<SandboxedCallResult> {
        let policy = loader.policy();
        let limits = policy.limits();

        if limits.run_remote && !self.remote {
            if let Some(pool) = self.pool() {
                tracing::debug!(unit, policy = policy.name(), pool = pool.name(), "dispatching to worker pool");
                let task = SandboxTask::new(unit, policy.clone(), mode, args.to_vec());
                return pool.submit(task).get();
            }
            tracing::debug!(unit, policy = policy.name(), "no worker pool configured, running locally");
        }

        let args = self.bridge_arguments(args, loader.domain_id())?;
        let value = if limits.run_in_thread {
            self.run_in_thread(unit, loader, mode, args)?
        } else {
            execute_local(&EnforcementContext::new(), loader, unit, mode, args, None)?
        };
        Ok(SandboxedCallResult::new(value, loader.domain_id().clone()))
    }

    fn run_in_thread(&self, unit: &str, loader: &CodeLoader, mode: RunMode, args: Vec<Argument>) -> Result<Value> {
        let execution = ExecutionState::new();
        self.monitor
            .register(MonitoredExecution::new(Arc::clone(&execution), loader.policy().clone()));

        let (tx, rx) = mpsc::channel();
        let thread_execution = Arc::clone(&execution);
        let thread_loader = loader.clone();
        let thread_unit = unit.to_string();
        let thread_monitor = self.monitor.clone();
        let spawned = std::thread::Builder::new()
            .name(format!(
                "palisade-sandboxed-{}",
                NEXT_SANDBOXED_THREAD.fetch_add(1, Ordering::Relaxed)
            ))
            .spawn(move || {
                thread_execution.bind_current_thread();
                let ctx = EnforcementContext::for_execution(Arc::clone(&thread_execution));
                let outcome = execute_local(&ctx, &thread_loader, &thread_unit, mode, args, Some(&thread_monitor));
                thread_execution.finish();
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            execution.finish();
            return Err(e.into());
        }

        // Stop waiting as soon as the monitor kills the execution; the thread
        // winds down at its next checkpoint.
        loop {
            match rx.recv_timeout(self.monitor.poll_interval()) {
                Ok(outcome) => {
                    return match execution.kill_record() {
                        Some(kill) => Err(self.killed(&kill)),
                        None => outcome,
                    };
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(kill) = execution.kill_record() {
                        return Err(self.killed(&kill));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PalisadeError::ExecutionFailure {
                        unit: unit.to_string(),
                        message: "sandboxed thread ended without a result".into(),
                    });
                }
            }
        }
    }

    /// Outcome a caller sees for a kill. Inside a runtime process an unsafe
    /// kill is signalled so the pool quarantines the process.
    fn killed(&self, kill: &KillRecord) -> PalisadeError {
        if self.remote && !kill.safe {
            PalisadeError::UnsafeKillSignaled
        } else {
            PalisadeError::Killed {
                reason: kill.reason.clone(),
            }
        }
    }

    fn bridge_arguments(&self, args: &[Argument], target: &DomainId) -> Result<Vec<Argument>> {
        args.iter()
            .cloned()
            .map(|mut arg| {
                if arg.is_bridged() {
                    let value = self.bridge.bridge(arg.value().clone(), target)?;
                    arg.replace_value(value);
                }
                Ok(arg)
            })
            .collect()
    }

    /// Re-materialize `value` in `target` through the configured bridge.
    pub fn bridge(&self, value: Value, target: &DomainId) -> Result<Value> {
        self.bridge.bridge(value, target)
    }

    #[must_use]
    pub fn bridge_handle(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    // Freelancers

    fn require_pool(&self) -> Result<Arc<WorkerPool>> {
        self.pool()
            .ok_or_else(|| PalisadeError::Config("no worker pool configured".into()))
    }

    pub fn acquire_freelancer(&self) -> Result<Freelancer> {
        self.require_pool()?.acquire_freelancer()
    }

    pub fn acquire_freelancer_timeout(&self, timeout: std::time::Duration) -> Result<Option<Freelancer>> {
        self.require_pool()?.acquire_freelancer_timeout(timeout)
    }

    pub fn release_freelancer(&self, freelancer: Freelancer) {
        freelancer.release();
    }

    /// Stop the pool and the monitor.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool() {
            pool.shutdown();
        }
        self.monitor.shutdown();
    }
}

impl Drop for ExecutionCoordinator {
    fn drop(&mut self) {
        self.monitor.shutdown();
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("remote", &self.remote)
            .field("pool", &self.pool.read().as_ref().map(|p| p.name().to_string()))
            .field("contexts", &self.registry.names())
            .finish_non_exhaustive()
    }
}

/// Load, construct and run `unit` on the calling thread, arming `ctx` in
/// `Sandboxed` mode. Panics become execution failures. Threads the unit
/// starts are registered with `monitor`, if given.
fn execute_local(
    ctx: &EnforcementContext,
    loader: &CodeLoader,
    unit: &str,
    mode: RunMode,
    args: Vec<Argument>,
    monitor: Option<&MonitorService>,
) -> Result<Value> {
    let token = match mode {
        RunMode::Sandboxed => Some(ctx.arm_new(loader.policy().clone())?),
        RunMode::InContext => None,
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| invoke(ctx, loader, unit, &args, monitor)));
    if let Some(token) = token {
        ctx.disarm(&token)?;
    }
    let result = outcome.unwrap_or_else(|panic| Err(PalisadeError::unit_failure(panic_message(panic.as_ref()))));
    result.map_err(|e| match e {
        PalisadeError::ExecutionFailure { unit: failed, message } if failed.is_empty() => {
            PalisadeError::ExecutionFailure {
                unit: unit.to_string(),
                message,
            }
        }
        other => other,
    })
}

fn invoke(
    ctx: &EnforcementContext,
    loader: &CodeLoader,
    unit: &str,
    args: &[Argument],
    monitor: Option<&MonitorService>,
) -> Result<Value> {
    let mut instance = loader.load(unit, ctx)?.instantiate(args)?;
    let _frame = FrameGuard::enter(ctx.execution(), unit);
    let mut env = UnitEnv::new(ctx, loader).with_monitor(monitor);
    instance.execute(&mut env)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unit panicked".to_string())
}
