//! Runaway execution monitoring
//!
//! The monitor thread polls registered executions and kills those that
//! exceed their policy's stack depth or run time. A kill cancels the
//! execution cooperatively and classifies it from the critical sections
//! held at that moment. The watchdog thread restarts the monitor thread if
//! it ever stops.

mod watchdog;

use crate::config::MonitorConfig;
use crate::exec::{ExecutionState, KillRecord};
use crate::policy::{PolicyHandle, RuntimeMode};
use crate::stack::AccessStack;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static NEXT_SERVICE: AtomicUsize = AtomicUsize::new(1);

/// An in-process execution under observation.
#[derive(Debug, Clone)]
pub struct MonitoredExecution {
    execution: Arc<ExecutionState>,
    policy: PolicyHandle,
    registered: Instant,
}

impl MonitoredExecution {
    #[must_use]
    pub fn new(execution: Arc<ExecutionState>, policy: PolicyHandle) -> Self {
        Self {
            execution,
            policy,
            registered: Instant::now(),
        }
    }

    #[must_use]
    pub const fn execution(&self) -> &Arc<ExecutionState> {
        &self.execution
    }

    #[must_use]
    pub const fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.execution.is_finished() && self.execution.kill_record().is_none()
    }

    /// Time counted against the policy's run time limit.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match self.policy.limits().runtime_mode {
            RuntimeMode::CpuTime => self.execution.cpu_time().unwrap_or_else(|| self.registered.elapsed()),
            RuntimeMode::WallClock => self.registered.elapsed(),
        }
    }

    fn violation(&self) -> Option<String> {
        let limits = self.policy.limits();
        if let Some(max) = limits.max_stack_depth {
            let depth = self.execution.depth();
            if depth >= max {
                return Some(format!("stack depth {depth} reached the maximum of {max}"));
            }
        }
        if let Some(max) = limits.max_run_time {
            let elapsed = self.elapsed();
            if elapsed > max {
                return Some(format!("run time {elapsed:?} exceeded the maximum of {max:?}"));
            }
        }
        None
    }
}

/// Diagnostic for a kill that hit an execution inside a critical section.
#[derive(Debug, Clone)]
pub struct BadKillReport {
    pub execution_id: u64,
    pub policy: String,
    pub reason: String,
    pub held_sections: usize,
    pub stack: AccessStack,
}

/// Receives diagnostics from the monitor and the coordinator.
pub trait SandboxObserver: Send + Sync {
    fn bad_kill(&self, _report: &BadKillReport) {}

    fn context_registered(&self, _name: &str, _policy: &PolicyHandle) {}
}

#[derive(Default)]
pub(crate) struct Observers(RwLock<Vec<Arc<dyn SandboxObserver>>>);

impl Observers {
    pub(crate) fn attach(&self, observer: Arc<dyn SandboxObserver>) {
        self.0.write().push(observer);
    }

    pub(crate) fn detach(&self, observer: &Arc<dyn SandboxObserver>) -> bool {
        let mut observers = self.0.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    /// Call `f` on every observer; a panicking observer is logged and skipped.
    pub(crate) fn notify(&self, f: impl Fn(&dyn SandboxObserver)) {
        let observers = self.0.read().clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::error!("sandbox observer panicked");
            }
        }
    }
}

/// State shared by the monitor thread and everyone registering work.
pub(crate) struct MonitorShared {
    registry: Mutex<Vec<MonitoredExecution>>,
    observers: Observers,
    poll_interval: Duration,
}

impl MonitorShared {
    /// One monitoring cycle.
    fn poll(&self) {
        let live: Vec<MonitoredExecution> = {
            let mut registry = self.registry.lock();
            registry.retain(MonitoredExecution::is_alive);
            registry.clone()
        };
        for entry in live {
            if let Some(reason) = entry.violation() {
                self.kill(&entry, reason);
            }
        }
    }

    fn kill(&self, entry: &MonitoredExecution, reason: String) -> KillRecord {
        let execution = entry.execution();
        self.registry.lock().retain(|e| e.execution.id() != execution.id());

        let held_sections = execution.held_sections();
        let stack = execution.access_stack();
        let record = KillRecord {
            reason: reason.clone(),
            safe: held_sections == 0,
        };
        if !execution.record_kill(record.clone()) {
            return execution.kill_record().unwrap_or(record);
        }
        execution.cancel();

        if record.safe {
            tracing::warn!(execution_id = execution.id(), policy = entry.policy.name(), %reason, "execution killed");
        } else {
            tracing::error!(
                execution_id = execution.id(),
                policy = entry.policy.name(),
                held_sections,
                %reason,
                "bad kill, stack:\n{stack}"
            );
            let report = BadKillReport {
                execution_id: execution.id(),
                policy: entry.policy.name().to_string(),
                reason,
                held_sections,
                stack,
            };
            self.observers.notify(|o| o.bad_kill(&report));
        }
        record
    }
}

/// A background thread with a stop flag.
struct DaemonThread {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DaemonThread {
    fn is_active(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.thread().unpark();
    }
}

pub(crate) struct ServiceInner {
    name: String,
    shared: Arc<MonitorShared>,
    config: MonitorConfig,
    monitor: Mutex<Option<DaemonThread>>,
    watchdog: Mutex<Option<DaemonThread>>,
    /// Cleared by an explicit stop; the watchdog only revives a wanted monitor.
    monitor_wanted: AtomicBool,
    generation: AtomicUsize,
}

impl ServiceInner {
    pub(crate) fn is_monitor_active(&self) -> bool {
        self.monitor.lock().as_ref().is_some_and(DaemonThread::is_active)
    }

    pub(crate) fn start_monitor(&self) -> Result<()> {
        let mut slot = self.monitor.lock();
        self.monitor_wanted.store(true, Ordering::SeqCst);
        self.spawn_monitor(&mut slot)
    }

    /// Restart the monitor thread if it ended without being stopped.
    pub(crate) fn revive_monitor(&self) -> Result<bool> {
        let mut slot = self.monitor.lock();
        if !self.monitor_wanted.load(Ordering::SeqCst) || slot.as_ref().is_some_and(DaemonThread::is_active) {
            return Ok(false);
        }
        self.spawn_monitor(&mut slot).map(|()| true)
    }

    fn spawn_monitor(&self, slot: &mut Option<DaemonThread>) -> Result<()> {
        if slot.as_ref().is_some_and(DaemonThread::is_active) {
            return Ok(());
        }
        if let Some(old) = slot.take() {
            old.stop();
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name(format!("{}-{generation}", self.name))
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    shared.poll();
                    std::thread::park_timeout(shared.poll_interval);
                }
            })?;
        tracing::debug!(monitor = %self.name, generation, "monitor thread started");
        *slot = Some(DaemonThread { shutdown, handle });
        Ok(())
    }

    fn stop_monitor(&self) {
        let mut slot = self.monitor.lock();
        self.monitor_wanted.store(false, Ordering::SeqCst);
        if let Some(thread) = slot.take() {
            thread.stop();
        }
    }

    /// End the monitor thread the way a crash would, leaving it wanted.
    #[cfg(test)]
    pub(crate) fn halt_monitor_thread(&self) {
        if let Some(thread) = self.monitor.lock().as_ref() {
            thread.shutdown.store(true, Ordering::SeqCst);
            thread.handle.thread().unpark();
        }
    }

    fn stop_watchdog(&self) {
        if let Some(thread) = self.watchdog.lock().take() {
            thread.stop();
        }
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.stop_watchdog();
        self.stop_monitor();
    }
}

/// Monitor plus watchdog, with start/stop control over both threads.
#[derive(Clone)]
pub struct MonitorService {
    inner: Arc<ServiceInner>,
}

impl MonitorService {
    /// A service with both threads stopped.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        let name = format!("palisade-monitor-{}", NEXT_SERVICE.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(ServiceInner {
                name,
                shared: Arc::new(MonitorShared {
                    registry: Mutex::new(Vec::new()),
                    observers: Observers::default(),
                    poll_interval: config.poll_interval,
                }),
                config,
                monitor: Mutex::new(None),
                watchdog: Mutex::new(None),
                monitor_wanted: AtomicBool::new(false),
                generation: AtomicUsize::new(1),
            }),
        }
    }

    /// A service with the monitor and the watchdog running.
    pub fn start(config: MonitorConfig) -> Result<Self> {
        let service = Self::new(config);
        service.start_monitor()?;
        service.start_watchdog()?;
        Ok(service)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.inner.config.poll_interval
    }

    pub fn register(&self, execution: MonitoredExecution) {
        self.inner.shared.registry.lock().push(execution);
    }

    /// Executions currently tracked, finished ones included until the next cycle.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.inner.shared.registry.lock().len()
    }

    pub fn attach_observer(&self, observer: Arc<dyn SandboxObserver>) {
        self.inner.shared.observers.attach(observer);
    }

    pub fn detach_observer(&self, observer: &Arc<dyn SandboxObserver>) -> bool {
        self.inner.shared.observers.detach(observer)
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.inner.shared.observers
    }

    /// Run one monitoring cycle on the calling thread.
    pub fn poll_once(&self) {
        self.inner.shared.poll();
    }

    /// Kill `execution` now, as the monitor would.
    pub fn kill(&self, execution: &MonitoredExecution, reason: impl Into<String>) -> KillRecord {
        self.inner.shared.kill(execution, reason.into())
    }

    pub fn start_monitor(&self) -> Result<()> {
        self.inner.start_monitor()
    }

    pub fn stop_monitor(&self) {
        self.inner.stop_monitor();
    }

    #[must_use]
    pub fn is_monitor_active(&self) -> bool {
        self.inner.is_monitor_active()
    }

    pub fn start_watchdog(&self) -> Result<()> {
        let mut slot = self.inner.watchdog.lock();
        if slot.as_ref().is_some_and(DaemonThread::is_active) {
            return Ok(());
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = watchdog::spawn(
            Arc::downgrade(&self.inner),
            Arc::clone(&shutdown),
            self.inner.config.watchdog_interval,
            format!("{}-watchdog", self.inner.name),
        )?;
        *slot = Some(DaemonThread { shutdown, handle });
        Ok(())
    }

    pub fn stop_watchdog(&self) {
        self.inner.stop_watchdog();
    }

    #[must_use]
    pub fn is_watchdog_active(&self) -> bool {
        self.inner.watchdog.lock().as_ref().is_some_and(DaemonThread::is_active)
    }

    /// Stop both threads and forget every tracked execution.
    pub fn shutdown(&self) {
        self.inner.stop_watchdog();
        self.inner.stop_monitor();
        self.inner.shared.registry.lock().clear();
    }
}
