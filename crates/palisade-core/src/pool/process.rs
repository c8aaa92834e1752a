//! Handles to isolated runtime processes

use super::SandboxTask;
use crate::backoff::ConnectDelays;
use crate::channel::RpcChannel;
use crate::config::PoolConfig;
use crate::policy::PolicyHandle;
use crate::protocol::{Request, Response};
use crate::result::SandboxedCallResult;
use crate::unit::Argument;
use crate::{PalisadeError, Result};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Startup flag that turns a program into a runtime process.
pub const WORKER_FLAG: &str = "--palisade-worker";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The RPC surface of one isolated runtime process.
///
/// Every call probes liveness first; a failed probe or a broken transport is
/// reported as `ProcessUnreachable`, never as an application failure.
pub trait RemoteRuntime: Send {
    /// Identity of the underlying process
    fn process_id(&self) -> u64;

    fn name(&self) -> &str;

    fn is_alive(&mut self) -> bool;

    /// Bind the session to `policy`; fails if already bound.
    fn init(&mut self, policy: &PolicyHandle) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn execute(&mut self, task: &SandboxTask) -> Result<SandboxedCallResult>;

    fn run_in_context(&mut self, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult>;

    fn run_sandboxed(&mut self, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult>;

    fn register_context(&mut self, name: &str, policy: &PolicyHandle) -> Result<()>;

    /// Terminate the process. Idempotent.
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}

/// Launches runtime processes for a pool.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn RemoteRuntime>>;
}

/// A child process running `palisade-worker`, reached over localhost TCP.
#[derive(Debug)]
pub struct RemoteProcess {
    name: String,
    child: Child,
    channel: Option<RpcChannel>,
    destroyed: bool,
}

impl RemoteProcess {
    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        match &self.channel {
            Some(channel) => Some(channel.port()),
            None => None,
        }
    }

    fn channel(&mut self) -> Result<&mut RpcChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| PalisadeError::ProcessUnreachable(format!("process {} is destroyed", self.name)))
    }

    fn probe(&mut self) -> Result<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Err(PalisadeError::ProcessUnreachable(format!(
                "process {} exited with {status}",
                self.name
            )));
        }
        let channel = self.channel()?;
        channel.set_read_timeout(Some(PROBE_TIMEOUT))?;
        let response = channel.call(&Request::Ping);
        channel.set_read_timeout(None)?;
        match response? {
            Response::Pong { .. } => Ok(()),
            other => Err(PalisadeError::ProcessUnreachable(format!(
                "unexpected liveness answer: {other:?}"
            ))),
        }
    }

    /// Liveness probe followed by the call itself.
    fn call(&mut self, request: &Request) -> Result<Response> {
        self.probe()?;
        self.channel()?.call(request)
    }
}

impl RemoteRuntime for RemoteProcess {
    fn process_id(&self) -> u64 {
        u64::from(self.child.id())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&mut self) -> bool {
        self.probe().is_ok()
    }

    fn init(&mut self, policy: &PolicyHandle) -> Result<()> {
        self.call(&Request::Init { policy: policy.clone() })?.into_done()
    }

    fn reset(&mut self) -> Result<()> {
        self.call(&Request::Reset)?.into_done()
    }

    fn execute(&mut self, task: &SandboxTask) -> Result<SandboxedCallResult> {
        self.call(&Request::Execute { task: task.clone() })?.into_result()
    }

    fn run_in_context(&mut self, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.call(&Request::RunInContext {
            unit: unit.to_string(),
            args: args.to_vec(),
        })?
        .into_result()
    }

    fn run_sandboxed(&mut self, unit: &str, args: &[Argument]) -> Result<SandboxedCallResult> {
        self.call(&Request::RunSandboxed {
            unit: unit.to_string(),
            args: args.to_vec(),
        })?
        .into_result()
    }

    fn register_context(&mut self, name: &str, policy: &PolicyHandle) -> Result<()> {
        self.call(&Request::RegisterContext {
            name: name.to_string(),
            policy: policy.clone(),
        })?
        .into_done()
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.send(&Request::Shutdown);
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!(process = %self.name, error = %e, "kill failed, process already gone");
        }
        let _ = self.child.wait();
        tracing::info!(process = %self.name, "runtime process destroyed");
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Cycles through a port range, skipping ports that cannot be bound.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    next: u16,
}

impl PortAllocator {
    #[must_use]
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max, next: min }
    }

    pub fn allocate(&mut self) -> Result<u16> {
        let span = u32::from(self.max - self.min) + 1;
        for _ in 0..span {
            let port = self.next;
            self.next = if port >= self.max { self.min } else { port + 1 };
            if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
                return Ok(port);
            }
        }
        Err(PalisadeError::Spawn(format!(
            "no free port in {}..={}",
            self.min, self.max
        )))
    }
}

/// Spawns `palisade-worker` processes on localhost ports.
#[derive(Debug)]
pub struct LocalProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    ports: Mutex<PortAllocator>,
    connect_attempts: u32,
    first_delay: Duration,
    max_delay: Duration,
    counter: AtomicU32,
}

impl LocalProcessSpawner {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            program: config.resolve_worker_program()?,
            args: config.worker_args.clone(),
            ports: Mutex::new(PortAllocator::new(config.min_port, config.max_port)),
            connect_attempts: config.connect_attempts,
            first_delay: config.connect_backoff,
            max_delay: config.max_connect_backoff,
            counter: AtomicU32::new(1),
        })
    }

    fn connect(&self, name: &str, port: u16, child: &mut Child) -> Result<RpcChannel> {
        let mut delays = ConnectDelays::new(self.connect_attempts, self.first_delay, self.max_delay);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Ok(Some(status)) = child.try_wait() {
                return Err(PalisadeError::Spawn(format!("process {name} exited with {status}")));
            }
            let error = match RpcChannel::connect(port, PROBE_TIMEOUT) {
                Ok(mut channel) => match channel.call(&Request::Ping) {
                    Ok(Response::Pong { .. }) => return Ok(channel),
                    Ok(other) => PalisadeError::Codec(format!("unexpected liveness answer: {other:?}")),
                    Err(e) => e,
                },
                Err(e) => e,
            };
            let Some(delay) = delays.next() else {
                return Err(PalisadeError::Spawn(format!(
                    "process {name} unreachable on port {port} after {attempt} attempts: {error}"
                )));
            };
            tracing::debug!(process = name, port, attempt, ?delay, "runtime process not ready");
            std::thread::sleep(delay);
        }
    }
}

impl ProcessSpawner for LocalProcessSpawner {
    fn spawn(&self) -> Result<Box<dyn RemoteRuntime>> {
        let name = format!("Nr{}", self.counter.fetch_add(1, Ordering::Relaxed));
        let port = self.ports.lock().allocate()?;

        tracing::info!(process = %name, port, program = ?self.program, "spawning runtime process");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(WORKER_FLAG)
            .arg("--name")
            .arg(&name)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| PalisadeError::Spawn(format!("{}: {e}", self.program.display())))?;

        match self.connect(&name, port, &mut child) {
            Ok(channel) => {
                tracing::info!(process = %name, port, pid = child.id(), "runtime process ready");
                Ok(Box::new(RemoteProcess {
                    name,
                    child,
                    channel: Some(channel),
                    destroyed: false,
                }))
            }
            Err(e) => {
                tracing::warn!(process = %name, port, error = %e, "runtime process failed to start");
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }
}
