//! # palisade-core
//!
//! Policy-driven sandboxing for untrusted units of code running inside a
//! trusted host.
//!
//! This crate provides the core mechanisms:
//! - Permission policies arranged in an arena of routed sub-policies
//! - Per-execution enforcement contexts armed with a policy
//! - Isolated code loaders, one per policy node
//! - A monitor and watchdog that kill runaway executions
//! - A pool of isolated runtime processes reached over localhost RPC

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod enforcer;
pub mod error;
pub mod exec;
pub mod loader;
pub mod monitor;
pub mod policy;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod result;
pub mod stack;
pub mod unit;

pub use config::{CoordinatorConfig, MonitorConfig, PoolConfig};
pub use coordinator::{ExecutionCoordinator, RunMode};
pub use enforcer::{ArmToken, EnforcementContext};
pub use error::{PalisadeError, RemoteFailure};
pub use loader::{CodeArchive, CodeLoader, HostDomain, LoadedUnit, LoaderEnhancer, ParentDomain};
pub use monitor::{BadKillReport, MonitorService, MonitoredExecution, SandboxObserver};
pub use policy::{PermissionPolicy, PolicyArena, PolicyHandle, PolicyId};
pub use pool::{Freelancer, PoolStatus, SandboxTask, TaskFuture, WorkerPool};
pub use registry::PolicyRegistry;
pub use result::{Bridge, DomainId, SandboxedCallResult, Value};
pub use stack::AccessStack;
pub use unit::{Argument, SandboxedUnit, UnitDefinition, UnitEnv};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, PalisadeError>;
