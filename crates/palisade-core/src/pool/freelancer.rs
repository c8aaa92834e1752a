//! Freelancers: pool processes driven directly by a caller
//!
//! A freelancer is checked out of a FIFO-fair queue, used for
//! `init`/`run`/`reset` call sequences and handed back. A process that
//! reported an unsafe kill or stopped answering is replaced on release
//! instead of being reset.

use super::process::{ProcessSpawner, RemoteRuntime};
use crate::policy::PolicyHandle;
use crate::result::SandboxedCallResult;
use crate::unit::Argument;
use crate::{PalisadeError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct FreelancerSlot {
    pub(crate) id: usize,
    process: Option<Box<dyn RemoteRuntime>>,
    restart_on_release: bool,
}

impl FreelancerSlot {
    pub(crate) fn spawn(id: usize, spawner: &dyn ProcessSpawner) -> Result<Self> {
        Ok(Self {
            id,
            process: Some(spawner.spawn()?),
            restart_on_release: false,
        })
    }

    fn destroy(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.destroy();
        }
    }

    fn restart(&mut self, spawner: &dyn ProcessSpawner) {
        self.destroy();
        self.restart_on_release = false;
        match spawner.spawn() {
            Ok(process) => {
                tracing::info!(freelancer = self.id, process = process.name(), "freelancer process replaced");
                self.process = Some(process);
            }
            Err(e) => {
                tracing::error!(freelancer = self.id, error = %e, "failed to replace freelancer process");
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    slots: VecDeque<FreelancerSlot>,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    closed: bool,
}

/// Bounded, fair queue of idle freelancers.
#[derive(Default)]
pub(crate) struct FreelancerQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl FreelancerQueue {
    /// Wait for the oldest waiter's turn and a free slot. `Ok(None)` on timeout.
    pub(crate) fn acquire(&self, deadline: Option<Instant>) -> Result<Option<FreelancerSlot>> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            if state.closed {
                state.waiters.retain(|t| *t != ticket);
                return Err(PalisadeError::PoolShutdown);
            }
            if state.waiters.front() == Some(&ticket) {
                if let Some(slot) = state.slots.pop_front() {
                    state.waiters.pop_front();
                    self.changed.notify_all();
                    return Ok(Some(slot));
                }
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    state.waiters.retain(|t| *t != ticket);
                    self.changed.notify_all();
                    return Ok(None);
                }
                Some(deadline) => {
                    self.changed.wait_until(&mut state, deadline);
                }
                None => self.changed.wait(&mut state),
            }
        }
    }

    /// Return a slot; a closed queue hands it back to the caller.
    fn give_back(&self, slot: FreelancerSlot) -> Option<FreelancerSlot> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(slot);
        }
        state.slots.push_back(slot);
        self.changed.notify_all();
        None
    }

    pub(crate) fn push(&self, slot: FreelancerSlot) {
        if let Some(mut slot) = self.give_back(slot) {
            slot.destroy();
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Close the queue and destroy every idle freelancer.
    pub(crate) fn close(&self) {
        let slots: Vec<FreelancerSlot> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.slots.drain(..).collect()
        };
        self.changed.notify_all();
        for mut slot in slots {
            slot.destroy();
        }
    }
}

/// A checked-out freelancer. Dropping it releases it back to its pool.
pub struct Freelancer {
    slot: Option<FreelancerSlot>,
    queue: Arc<FreelancerQueue>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl Freelancer {
    pub(crate) fn new(slot: FreelancerSlot, queue: Arc<FreelancerQueue>, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            slot: Some(slot),
            queue,
            spawner,
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.id)
    }

    /// Identity of the bound process, if one is running.
    #[must_use]
    pub fn process_id(&self) -> Option<u64> {
        self.slot
            .as_ref()
            .and_then(|s| s.process.as_ref())
            .map(|p| p.process_id())
    }

    /// Whether the next release replaces the process.
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.slot.as_ref().is_some_and(|s| s.restart_on_release)
    }

    pub fn init(&mut self, policy: &PolicyHandle) -> Result<()> {
        self.call(|p| p.init(policy))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.call(|p| p.reset())
    }

    pub fn run_in_context(&mut self, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.call(|p| p.run_in_context(unit, args))
    }

    pub fn run_sandboxed(&mut self, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.call(|p| p.run_sandboxed(unit, args))
    }

    pub fn register_context(&mut self, name: &str, policy: &PolicyHandle) -> Result<()> {
        self.call(|p| p.register_context(name, policy))
    }

    fn call<T>(&mut self, f: impl FnOnce(&mut dyn RemoteRuntime) -> Result<T>) -> Result<T> {
        let slot = self.slot.as_mut().ok_or(PalisadeError::PoolShutdown)?;
        if slot.process.is_none() {
            slot.process = Some(self.spawner.spawn()?);
        }
        let process = slot.process.as_mut().ok_or(PalisadeError::PoolShutdown)?;
        let result = f(process.as_mut());
        match &result {
            Err(PalisadeError::ProcessUnreachable(reason)) => {
                tracing::warn!(freelancer = slot.id, %reason, "freelancer process unreachable, replacing it");
                slot.restart(self.spawner.as_ref());
            }
            Err(PalisadeError::UnsafeKillSignaled) => {
                tracing::warn!(freelancer = slot.id, "unsafe kill inside freelancer process, replacing it on release");
                slot.restart_on_release = true;
            }
            _ => {}
        }
        result
    }

    /// Hand the freelancer back: reset its session, or replace its process
    /// if it was quarantined.
    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        let Some(mut slot) = self.slot.take() else {
            return;
        };
        let spawner = self.spawner.as_ref();
        if slot.restart_on_release {
            slot.restart(spawner);
        } else if let Some(process) = slot.process.as_mut() {
            if let Err(e) = process.reset() {
                tracing::warn!(freelancer = slot.id, error = %e, "reset failed, replacing freelancer process");
                slot.restart(spawner);
            }
        }
        self.queue.push(slot);
    }
}

impl Drop for Freelancer {
    fn drop(&mut self) {
        self.release_slot();
    }
}

impl std::fmt::Debug for Freelancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Freelancer")
            .field("id", &self.id())
            .field("process_id", &self.process_id())
            .field("quarantined", &self.is_quarantined())
            .finish()
    }
}
