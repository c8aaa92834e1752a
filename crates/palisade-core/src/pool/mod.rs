//! Pool of isolated runtime processes
//!
//! Workers pull [`SandboxTask`]s from a shared queue and run them in their
//! bound process; freelancers are handed out to callers for direct use.
//! A task whose process died is retried at the front of the queue on a
//! respawned process.

mod freelancer;
mod future;
mod process;
mod queue;
mod task;
mod worker;

pub use freelancer::Freelancer;
pub use future::TaskFuture;
pub use process::{LocalProcessSpawner, PortAllocator, ProcessSpawner, RemoteProcess, RemoteRuntime, WORKER_FLAG};
pub use task::SandboxTask;
pub use worker::{Worker, WorkerState};

use crate::config::PoolConfig;
use crate::{PalisadeError, Result};
use freelancer::{FreelancerQueue, FreelancerSlot};
use parking_lot::{Mutex, RwLock};
use queue::{QueuedTask, TaskQueue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_POOL: AtomicUsize = AtomicUsize::new(1);

/// Status of the worker pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub recycling: usize,
    pub dead: usize,
    pub freelancers_available: usize,
    pub queued: usize,
}

/// Everything one initialization of the pool owns.
struct Generation {
    queue: Arc<TaskQueue>,
    workers: Vec<Arc<Mutex<Worker>>>,
    freelancers: Arc<FreelancerQueue>,
    shutdown: Arc<AtomicBool>,
}

impl Generation {
    fn start(name: &str, config: &PoolConfig, spawner: &Arc<dyn ProcessSpawner>) -> Result<Self> {
        let mut generation = Self {
            queue: Arc::new(TaskQueue::default()),
            workers: Vec::with_capacity(config.pool_size),
            freelancers: Arc::new(FreelancerQueue::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        if let Err(e) = generation.populate(name, config, spawner) {
            generation.shutdown();
            return Err(e);
        }
        Ok(generation)
    }

    fn populate(&mut self, name: &str, config: &PoolConfig, spawner: &Arc<dyn ProcessSpawner>) -> Result<()> {
        for id in 0..config.pool_size {
            let worker_name = format!("{name}-{id}");
            let mut worker = Worker::new(id, worker_name.clone(), Arc::clone(spawner));
            worker.spawn()?;
            let worker = Arc::new(Mutex::new(worker));

            let thread_worker = Arc::clone(&worker);
            let queue = Arc::clone(&self.queue);
            let shutdown = Arc::clone(&self.shutdown);
            let max_retries = config.max_task_retries;
            std::thread::Builder::new()
                .name(worker_name)
                .spawn(move || worker::run(&thread_worker, &queue, &shutdown, max_retries))?;
            self.workers.push(worker);
        }

        for id in 0..config.freelancers {
            self.freelancers.push(FreelancerSlot::spawn(id, spawner.as_ref())?);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.close();
        self.freelancers.close();
        for worker in &self.workers {
            // Busy workers destroy their process once their task returns.
            if let Some(mut worker) = worker.try_lock() {
                worker.destroy();
            }
        }
    }
}

/// Fixed set of worker processes fed from a task queue, plus freelancers.
pub struct WorkerPool {
    name: String,
    config: PoolConfig,
    spawner: Arc<dyn ProcessSpawner>,
    current: RwLock<Arc<Generation>>,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Pool of `palisade-worker` processes launched on localhost.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let spawner = LocalProcessSpawner::new(&config)?;
        Self::with_spawner(config, Arc::new(spawner))
    }

    /// Pool whose processes come from `spawner`. All processes are started
    /// before this returns.
    pub fn with_spawner(config: PoolConfig, spawner: Arc<dyn ProcessSpawner>) -> Result<Self> {
        config.validate()?;
        let name = format!("palisade-pool-{}", NEXT_POOL.fetch_add(1, Ordering::Relaxed));
        let generation = Generation::start(&name, &config, &spawner)?;
        tracing::info!(
            pool = %name,
            workers = config.pool_size,
            freelancers = config.freelancers,
            "worker pool initialized"
        );
        Ok(Self {
            name,
            config,
            spawner,
            current: RwLock::new(Arc::new(generation)),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Queue a task; the future resolves once a worker ran it.
    pub fn submit(&self, task: SandboxTask) -> TaskFuture {
        let (promise, future) = future::pair();
        tracing::debug!(pool = %self.name, unit = task.unit(), "task submitted");
        self.current.read().queue.push_back(QueuedTask {
            task,
            promise,
            attempts: 0,
        });
        future
    }

    /// Block until a freelancer is free.
    pub fn acquire_freelancer(&self) -> Result<Freelancer> {
        self.acquire(None)?
            .ok_or_else(|| PalisadeError::Spawn("freelancer queue returned nothing".into()))
    }

    /// Wait at most `timeout` for a freelancer; `Ok(None)` when none freed up.
    pub fn acquire_freelancer_timeout(&self, timeout: Duration) -> Result<Option<Freelancer>> {
        self.acquire(Some(Instant::now() + timeout))
    }

    fn acquire(&self, deadline: Option<Instant>) -> Result<Option<Freelancer>> {
        let queue = Arc::clone(&self.current.read().freelancers);
        Ok(queue
            .acquire(deadline)?
            .map(|slot| Freelancer::new(slot, Arc::clone(&queue), Arc::clone(&self.spawner))))
    }

    pub fn release_freelancer(&self, freelancer: Freelancer) {
        freelancer.release();
    }

    /// Stop every worker and freelancer process. Pending tasks fail with
    /// `PoolShutdown`.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pool = %self.name, "shutting down worker pool");
        self.current.read().shutdown();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Shut down, then start again from the same configuration.
    pub fn restart(&self) -> Result<()> {
        let mut current = self.current.write();
        current.shutdown();
        self.stopped.store(true, Ordering::SeqCst);
        tracing::info!(pool = %self.name, "restarting worker pool");
        *current = Arc::new(Generation::start(&self.name, &self.config, &self.spawner)?);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let generation = Arc::clone(&self.current.read());
        let mut status = PoolStatus {
            total: generation.workers.len(),
            freelancers_available: generation.freelancers.available(),
            queued: generation.queue.len(),
            ..PoolStatus::default()
        };
        for worker in &generation.workers {
            // A held lock means the worker thread is inside a task.
            let state = worker.try_lock().map_or(WorkerState::Busy, |w| w.state());
            match state {
                WorkerState::Idle => status.idle += 1,
                WorkerState::Busy => status.busy += 1,
                WorkerState::Recycling => status.recycling += 1,
                WorkerState::Dead => status.dead += 1,
            }
        }
        status
    }

    /// Executions run by each worker since its last recycle.
    #[must_use]
    pub fn execution_counts(&self) -> Vec<u64> {
        self.current
            .read()
            .workers
            .iter()
            .map(|w| w.try_lock().map_or(0, |w| w.execution_count()))
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
