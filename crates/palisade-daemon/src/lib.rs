//! # palisade-daemon
//!
//! The isolated runtime process a `palisade-core` worker pool launches.
//! It listens on a localhost port, answers liveness probes and runs units
//! under the policies its client sends.
//!
//! Hosts that want their own units available remotely call
//! [`maybe_run_worker`] first thing in `main` and point the pool at their
//! own executable.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod config;
pub mod demo;
pub mod server;
pub mod session;

pub use config::WorkerArgs;
pub use session::RemoteSession;

use anyhow::{Context, Result};
use clap::Parser;
use palisade_core::pool::WORKER_FLAG;
use palisade_core::ParentDomain;
use std::ffi::OsString;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Serve `domain` on `args.port` until told to shut down.
pub fn run_worker(args: &WorkerArgs, domain: Arc<dyn ParentDomain>) -> Result<()> {
    let session = Arc::new(RemoteSession::new(args.name.clone(), domain, args.coordinator_config())?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("palisade-rpc")
        .build()
        .context("building the RPC runtime")?;

    runtime.block_on(async {
        let addr = args.addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        tracing::info!(process = %args.name, %addr, "runtime process listening");
        server::run(listener, session).await
    })?;

    tracing::info!(process = %args.name, "runtime process stopped");
    Ok(())
}

/// Run as a runtime process if this executable was launched as one.
///
/// Returns `None` for a normal launch; otherwise the outcome of serving,
/// after which the caller should exit.
pub fn maybe_run_worker(domain: impl FnOnce() -> Arc<dyn ParentDomain>) -> Option<Result<()>> {
    let argv = worker_argv(std::env::args_os())?;
    Some(WorkerArgs::try_parse_from(argv).map_err(Into::into).and_then(|args| run_worker(&args, domain())))
}

/// Program name plus everything from the worker flag on. Host arguments the
/// pool placed before the flag are dropped.
fn worker_argv(args: impl IntoIterator<Item = OsString>) -> Option<Vec<OsString>> {
    let mut args = args.into_iter();
    let program = args.next()?;
    let rest: Vec<OsString> = args.skip_while(|a| a != WORKER_FLAG).collect();
    if rest.is_empty() {
        return None;
    }
    Some(std::iter::once(program).chain(rest).collect())
}
