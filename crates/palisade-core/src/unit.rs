//! Sandboxable units and the environment they run in
//!
//! A unit is registered once as a [`UnitDefinition`] with an entry point
//! constructor. At run time it only reaches the outside world through its
//! [`UnitEnv`], which mediates every load, file access and thread start.

use crate::enforcer::EnforcementContext;
use crate::exec::{CriticalSection, FrameGuard};
use crate::loader::{CodeLoader, LoadedUnit};
use crate::monitor::{MonitorService, MonitoredExecution};
use crate::policy::{FileAction, Permission};
use crate::result::{DomainId, Value};
use crate::{PalisadeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Entry-point contract every sandboxable unit implements.
pub trait SandboxedUnit: Send {
    fn execute(&mut self, env: &mut UnitEnv<'_>) -> Result<Value>;
}

/// Constructor resolving a unit instance from its arguments
pub type EntryPoint = Arc<dyn Fn(&[Argument]) -> Result<Box<dyn SandboxedUnit>> + Send + Sync>;

/// Lifecycle callback run when a loaded unit is dropped
pub type Finalizer = Arc<dyn Fn() + Send + Sync>;

/// Registration record of a unit: name, opaque definition bytes, entry point.
#[derive(Clone)]
pub struct UnitDefinition {
    name: String,
    bytes: Vec<u8>,
    entry: Option<EntryPoint>,
    finalizer: Option<Finalizer>,
}

impl UnitDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: Vec::new(),
            entry: None,
            finalizer: None,
        }
    }

    #[must_use]
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.bytes = bytes.into();
        self
    }

    #[must_use]
    pub fn with_entry<F, U>(mut self, ctor: F) -> Self
    where
        F: Fn(&[Argument]) -> Result<U> + Send + Sync + 'static,
        U: SandboxedUnit + 'static,
    {
        self.entry = Some(Arc::new(move |args: &[Argument]| {
            ctor(args).map(|unit| Box::new(unit) as Box<dyn SandboxedUnit>)
        }));
        self
    }

    #[must_use]
    pub fn with_finalizer(mut self, finalizer: impl Fn() + Send + Sync + 'static) -> Self {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    pub(crate) fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }

    #[must_use]
    pub const fn has_entry(&self) -> bool {
        self.entry.is_some()
    }

    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    /// Remove the finalizer; returns whether there was one.
    pub(crate) fn strip_finalizer(&mut self) -> bool {
        self.finalizer.take().is_some()
    }

    pub(crate) fn into_parts(self) -> (String, Vec<u8>, Option<EntryPoint>, Option<Finalizer>) {
        (self.name, self.bytes, self.entry, self.finalizer)
    }
}

impl fmt::Debug for UnitDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitDefinition")
            .field("name", &self.name)
            .field("bytes", &self.bytes.len())
            .field("entry", &self.entry.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// One argument of a sandboxed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    value: Value,
    type_name: Option<String>,
    bridge: bool,
}

impl Argument {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            type_name: None,
            bridge: false,
        }
    }

    /// Argument carrying its declared type; bridged into the unit's domain
    /// before construction.
    pub fn typed(value: impl Into<Value>, type_name: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            type_name: Some(type_name.into()),
            bridge: true,
        }
    }

    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    #[must_use]
    pub const fn is_bridged(&self) -> bool {
        self.bridge
    }

    pub(crate) fn replace_value(&mut self, value: Value) {
        self.value = value;
    }
}

/// Everything a running unit may do, mediated by its enforcement context.
pub struct UnitEnv<'a> {
    ctx: &'a EnforcementContext,
    loader: &'a CodeLoader,
    monitor: Option<&'a MonitorService>,
}

impl<'a> UnitEnv<'a> {
    #[must_use]
    pub const fn new(ctx: &'a EnforcementContext, loader: &'a CodeLoader) -> Self {
        Self {
            ctx,
            loader,
            monitor: None,
        }
    }

    /// Register threads started from this environment with `monitor`.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Option<&'a MonitorService>) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub const fn context(&self) -> &EnforcementContext {
        self.ctx
    }

    #[must_use]
    pub fn domain_id(&self) -> &DomainId {
        self.loader.domain_id()
    }

    /// Fails with `Killed` once the monitor cancelled this execution.
    pub fn checkpoint(&self) -> Result<()> {
        if self.ctx.execution().is_cancelled() {
            return Err(PalisadeError::Killed {
                reason: "execution cancelled".into(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctx.execution().is_cancelled()
    }

    pub fn enter_frame(&self, type_name: impl Into<String>) -> FrameGuard {
        FrameGuard::enter(self.ctx.execution(), type_name)
    }

    pub fn critical_section(&self) -> CriticalSection {
        CriticalSection::enter(self.ctx.execution())
    }

    pub fn load(&self, name: &str) -> Result<Arc<LoadedUnit>> {
        self.checkpoint()?;
        self.loader.load(name, self.ctx)
    }

    pub fn instantiate(&self, name: &str, args: &[Argument]) -> Result<Box<dyn SandboxedUnit>> {
        self.load(name)?.instantiate(args)
    }

    /// Load, construct and run another unit inside this execution.
    pub fn call(&mut self, name: &str, args: &[Argument]) -> Result<Value> {
        let mut unit = self.instantiate(name, args)?;
        let _frame = self.enter_frame(name);
        unit.execute(self)
    }

    pub fn check_permission(&self, permission: &Permission) -> Result<()> {
        self.checkpoint()?;
        self.ctx.check_permission(permission)
    }

    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        self.check_permission(&Permission::file(FileAction::Read, path.to_string_lossy()))?;
        Ok(std::fs::read(path)?)
    }

    pub fn write_file(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        self.check_permission(&Permission::file(FileAction::Write, path.to_string_lossy()))?;
        Ok(std::fs::write(path, contents)?)
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.check_permission(&Permission::file(FileAction::Delete, path.to_string_lossy()))?;
        Ok(std::fs::remove_file(path)?)
    }

    /// Define a unit in this execution's loading domain.
    pub fn define(&self, definition: UnitDefinition) -> Result<Arc<LoadedUnit>> {
        self.check_permission(&Permission::runtime("defineUnit"))?;
        self.loader.define(definition, true)
    }

    /// Start a thread that inherits this execution's enforcement state.
    ///
    /// When this execution is monitored the thread is too, under the same
    /// policy limits counted from the thread's own start.
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<JoinHandle<Result<Value>>>
    where
        F: FnOnce(&mut UnitEnv<'_>) -> Result<Value> + Send + 'static,
    {
        self.check_permission(&Permission::runtime("spawnThread"))?;
        let ctx = self.ctx.inherit();
        let execution = Arc::clone(ctx.execution());
        let loader = self.loader.clone();
        let monitor = self.monitor.cloned();
        if let Some(monitor) = &monitor {
            monitor.register(MonitoredExecution::new(Arc::clone(&execution), loader.policy().clone()));
        }
        let spawned = std::thread::Builder::new().name(name.into()).spawn(move || {
            ctx.execution().bind_current_thread();
            let mut env = UnitEnv::new(&ctx, &loader).with_monitor(monitor.as_ref());
            let outcome = f(&mut env);
            ctx.execution().finish();
            outcome
        });
        spawned.map_err(|e| {
            execution.finish();
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Constant(Value);

    impl SandboxedUnit for Constant {
        fn execute(&mut self, _env: &mut UnitEnv<'_>) -> Result<Value> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn entry_point_builds_from_arguments() {
        let def = UnitDefinition::new("demo.Constant")
            .with_entry(|args: &[Argument]| Ok(Constant(args.first().map_or(Value::Null, |a| a.value().clone()))));
        assert!(def.has_entry());
        assert!(!def.has_finalizer());
        let (_, _, entry, _) = def.into_parts();
        let entry = entry.expect("entry");
        assert!(entry(&[Argument::new(json!(3))]).is_ok());
    }

    #[test]
    fn typed_arguments_are_bridged() {
        let arg = Argument::typed(json!({"x": 1}), "demo.Point");
        assert!(arg.is_bridged());
        assert_eq!(arg.type_name(), Some("demo.Point"));
        assert!(!Argument::new(1).is_bridged());
    }
}
