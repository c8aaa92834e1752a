//! Pool, monitor and coordinator configuration

use crate::{PalisadeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a pool of isolated runtime processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of queue-driven workers
    pub pool_size: usize,

    /// Number of freelancer slots
    pub freelancers: usize,

    /// Program launched for each runtime process (`None` resolves at spawn time)
    pub worker_program: Option<PathBuf>,

    /// Arguments placed before the worker flag on the command line
    pub worker_args: Vec<String>,

    /// First port tried for a runtime process endpoint
    pub min_port: u16,

    /// Last port tried before wrapping around
    pub max_port: u16,

    /// Connection attempts before a spawn is abandoned
    pub connect_attempts: u32,

    /// Delay before the second connection attempt
    pub connect_backoff: Duration,

    /// Upper bound for the connection backoff
    pub max_connect_backoff: Duration,

    /// Resubmissions after a process death before the task's future fails
    pub max_task_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            freelancers: 1,
            worker_program: None,
            worker_args: Vec::new(),
            min_port: 10000,
            max_port: 10200,
            connect_attempts: 10,
            connect_backoff: Duration::from_millis(100),
            max_connect_backoff: Duration::from_secs(1),
            max_task_retries: 5,
        }
    }
}

impl PoolConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Program to launch, falling back to [`default_worker_program`].
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(path) => Ok(path.clone()),
            None => default_worker_program(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            return Err(PalisadeError::Config(format!(
                "empty port range {}..={}",
                self.min_port, self.max_port
            )));
        }
        if self.connect_attempts == 0 {
            return Err(PalisadeError::Config("connect_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Builder for PoolConfig
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    #[must_use]
    pub const fn pool_size(mut self, workers: usize) -> Self {
        self.config.pool_size = workers;
        self
    }

    #[must_use]
    pub const fn freelancers(mut self, count: usize) -> Self {
        self.config.freelancers = count;
        self
    }

    #[must_use]
    pub fn worker_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.worker_program = Some(path.into());
        self
    }

    #[must_use]
    pub fn worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.worker_args.push(arg.into());
        self
    }

    #[must_use]
    pub const fn port_range(mut self, min: u16, max: u16) -> Self {
        self.config.min_port = min;
        self.config.max_port = max;
        self
    }

    #[must_use]
    pub const fn connect_attempts(mut self, attempts: u32) -> Self {
        self.config.connect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn connect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.connect_backoff = initial;
        self.config.max_connect_backoff = max;
        self
    }

    #[must_use]
    pub const fn max_task_retries(mut self, retries: u32) -> Self {
        self.config.max_task_retries = retries;
        self
    }

    #[must_use]
    pub fn build(self) -> PoolConfig {
        self.config
    }
}

/// Timing of the runaway monitor and its watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Pause between two monitoring cycles
    pub poll_interval: Duration,

    /// Pause between two watchdog checks of the monitor thread
    pub watchdog_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            watchdog_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration of an execution coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub monitor: MonitorConfig,

    /// Pool created together with the coordinator, if any
    pub pool: Option<PoolConfig>,

    /// Set inside runtime processes so work is never re-dispatched remotely
    pub remote: bool,
}

impl CoordinatorConfig {
    #[must_use]
    pub fn remote() -> Self {
        Self {
            remote: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub const fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }
}

/// Get the runtime process program from PALISADE_WORKER or the current executable
///
/// Returns:
/// - `$PALISADE_WORKER` if set
/// - the path of the running executable otherwise
pub fn default_worker_program() -> Result<PathBuf> {
    match std::env::var_os("PALISADE_WORKER") {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(std::env::current_exe()?),
    }
}
