//! palisade-worker - Isolated runtime process serving the demo units
//!
//! Launched by a worker pool as
//! `palisade-worker --palisade-worker --name Nr1 --port 10000`.

use anyhow::Result;
use clap::Parser;
use palisade_daemon::{demo, WorkerArgs};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Logs go to stderr; the pool inherits it.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("palisade=info".parse()?))
        .init();

    let args = WorkerArgs::parse();
    tracing::info!(process = %args.name, port = args.port, "palisade-worker starting");

    palisade_daemon::run_worker(&args, demo::domain())
}
