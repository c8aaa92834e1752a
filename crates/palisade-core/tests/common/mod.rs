#![allow(dead_code)]

use palisade_core::policy::PolicyHandle;
use palisade_core::pool::{ProcessSpawner, RemoteRuntime, SandboxTask};
use palisade_core::{Argument, DomainId, PalisadeError, Result, SandboxedCallResult};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared knobs and the execution log of every process a [`FakeSpawner`] made.
#[derive(Default)]
pub struct FakeWorld {
    /// Units whose next execution kills the process running them
    pub die_once: Mutex<HashSet<String>>,
    /// Units that report an unsafe kill inside the process
    pub unsafe_units: Mutex<HashSet<String>>,
    /// `"{pid}:{unit}"` for every execution attempt, in order
    pub log: Mutex<Vec<String>>,
    /// Pause before each execution finishes
    pub delay: Mutex<Duration>,
    pub spawned: AtomicU64,
    pub destroyed: Mutex<Vec<u64>>,
}

impl FakeWorld {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn die_once(&self, unit: &str) {
        self.die_once.lock().insert(unit.to_string());
    }

    pub fn make_unsafe(&self, unit: &str) {
        self.unsafe_units.lock().insert(unit.to_string());
    }
}

/// In-memory stand-in for runtime processes.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    pub world: Arc<FakeWorld>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self) -> Result<Box<dyn RemoteRuntime>> {
        let pid = self.world.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeProcess {
            pid,
            name: format!("Nr{pid}"),
            world: Arc::clone(&self.world),
            session: None,
            alive: true,
            destroyed: false,
        }))
    }
}

pub struct FakeProcess {
    pid: u64,
    name: String,
    world: Arc<FakeWorld>,
    session: Option<PolicyHandle>,
    alive: bool,
    destroyed: bool,
}

impl FakeProcess {
    fn probe(&self) -> Result<()> {
        if self.alive && !self.destroyed {
            Ok(())
        } else {
            Err(PalisadeError::ProcessUnreachable(format!("{} is gone", self.name)))
        }
    }

    fn run(&mut self, unit: &str) -> Result<SandboxedCallResult> {
        self.probe()?;
        self.world.log.lock().push(format!("{}:{unit}", self.pid));
        let delay = *self.world.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.world.die_once.lock().remove(unit) {
            self.alive = false;
            return Err(PalisadeError::ProcessUnreachable(format!("{} died running {unit}", self.name)));
        }
        if self.world.unsafe_units.lock().contains(unit) {
            return Err(PalisadeError::UnsafeKillSignaled);
        }
        Ok(SandboxedCallResult::new(json!(unit), DomainId::new(self.name.clone())))
    }
}

impl RemoteRuntime for FakeProcess {
    fn process_id(&self) -> u64 {
        self.pid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&mut self) -> bool {
        self.probe().is_ok()
    }

    fn init(&mut self, policy: &PolicyHandle) -> Result<()> {
        self.probe()?;
        if self.session.is_some() {
            return Err(PalisadeError::AlreadyInitialized);
        }
        self.session = Some(policy.clone());
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.probe()?;
        self.session = None;
        Ok(())
    }

    fn execute(&mut self, task: &SandboxTask) -> Result<SandboxedCallResult> {
        self.run(task.unit())
    }

    fn run_in_context(&mut self, unit: &str, _args: &[Argument]) -> Result<SandboxedCallResult> {
        if self.session.is_none() {
            return Err(PalisadeError::NotInitialized);
        }
        self.run(unit)
    }

    fn run_sandboxed(&mut self, unit: &str, _args: &[Argument]) -> Result<SandboxedCallResult> {
        if self.session.is_none() {
            return Err(PalisadeError::NotInitialized);
        }
        self.run(unit)
    }

    fn register_context(&mut self, _name: &str, _policy: &PolicyHandle) -> Result<()> {
        self.probe()
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.world.destroyed.lock().push(self.pid);
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}
