use super::process::{ProcessSpawner, RemoteRuntime};
use super::queue::{QueuedTask, TaskQueue};
use super::SandboxTask;
use crate::result::SandboxedCallResult;
use crate::{PalisadeError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready to accept work
    Idle,
    /// Currently executing a task
    Busy,
    /// Being recycled (destroyed and respawned)
    Recycling,
    /// No process bound
    Dead,
}

/// One pool slot bound 1:1 to a runtime process.
pub struct Worker {
    id: usize,
    name: String,
    state: WorkerState,
    process: Option<Box<dyn RemoteRuntime>>,
    execution_count: u64,
    spawner: Arc<dyn ProcessSpawner>,
}

impl Worker {
    pub(crate) fn new(id: usize, name: String, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            id,
            name,
            state: WorkerState::Dead,
            process: None,
            execution_count: 0,
            spawner,
        }
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    #[must_use]
    pub const fn execution_count(&self) -> u64 {
        self.execution_count
    }

    #[must_use]
    pub fn process_id(&self) -> Option<u64> {
        self.process.as_ref().map(|p| p.process_id())
    }

    pub fn spawn(&mut self) -> Result<()> {
        tracing::info!(worker = %self.name, "spawning runtime process");
        match self.spawner.spawn() {
            Ok(process) => {
                tracing::info!(worker = %self.name, process = process.name(), "worker ready");
                self.process = Some(process);
                self.state = WorkerState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = WorkerState::Dead;
                Err(e)
            }
        }
    }

    pub fn execute(&mut self, task: &SandboxTask) -> Result<SandboxedCallResult> {
        if self.process.is_none() {
            self.spawn()?;
        }
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| PalisadeError::Spawn(format!("worker {} has no process", self.name)))?;

        self.state = WorkerState::Busy;
        tracing::debug!(worker = %self.name, unit = task.unit(), "executing task");
        let result = process.execute(task);
        self.execution_count += 1;
        self.state = WorkerState::Idle;
        result
    }

    /// Destroy the bound process and start a fresh one.
    pub fn recycle(&mut self) -> Result<()> {
        tracing::info!(worker = %self.name, executions = self.execution_count, "recycling worker");
        self.state = WorkerState::Recycling;
        if let Some(mut process) = self.process.take() {
            process.destroy();
        }
        self.execution_count = 0;
        self.spawn()
    }

    pub fn destroy(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.destroy();
        }
        self.state = WorkerState::Dead;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Worker thread body: pull tasks from the front of the queue until it closes.
pub(crate) fn run(worker: &Mutex<Worker>, queue: &TaskQueue, shutdown: &AtomicBool, max_retries: u32) {
    while let Some(item) = queue.pop() {
        if shutdown.load(Ordering::SeqCst) {
            queue.push_front(item);
            break;
        }
        let mut worker = worker.lock();
        let QueuedTask {
            task,
            promise,
            attempts,
        } = item;
        match worker.execute(&task) {
            Err(PalisadeError::ProcessUnreachable(reason)) => {
                let attempts = attempts + 1;
                tracing::warn!(worker = %worker.name, unit = task.unit(), attempts, %reason, "runtime process unreachable");
                if let Err(e) = worker.recycle() {
                    tracing::error!(worker = %worker.name, error = %e, "respawn failed");
                    promise.complete(Err(e));
                } else if attempts > max_retries {
                    promise.complete(Err(PalisadeError::ProcessUnreachable(reason)));
                } else {
                    queue.push_front(QueuedTask {
                        task,
                        promise,
                        attempts,
                    });
                }
            }
            Err(PalisadeError::UnsafeKillSignaled) => {
                tracing::warn!(worker = %worker.name, unit = task.unit(), "unsafe kill inside runtime process, quarantining it");
                promise.complete(Err(PalisadeError::UnsafeKillSignaled));
                if let Err(e) = worker.recycle() {
                    tracing::error!(worker = %worker.name, error = %e, "respawn failed");
                }
            }
            result => promise.complete(result),
        }
        if shutdown.load(Ordering::SeqCst) {
            worker.destroy();
            break;
        }
    }
    tracing::debug!("worker thread exiting");
}
