//! Runtime process command line

use clap::Parser;
use palisade_core::{CoordinatorConfig, MonitorConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Arguments a pool passes to every runtime process it launches
#[derive(Debug, Clone, Parser)]
#[command(name = "palisade-worker", version, about = "Isolated runtime process for sandboxed executions")]
pub struct WorkerArgs {
    /// Marker placed by the spawning pool
    #[arg(long = "palisade-worker", hide = true)]
    pub worker: bool,

    /// Process name reported in liveness answers
    #[arg(long, default_value = "Nr0")]
    pub name: String,

    /// Port to listen on
    #[arg(long)]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Pause between two monitoring cycles
    #[arg(long, default_value_t = 10)]
    pub monitor_interval_ms: u64,
}

impl WorkerArgs {
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Coordinator settings inside the process: never re-dispatch remotely.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::remote().with_monitor(MonitorConfig {
            poll_interval: Duration::from_millis(self.monitor_interval_ms.max(1)),
            ..MonitorConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_command_line_parses() {
        let args = WorkerArgs::try_parse_from(["palisade-worker", "--palisade-worker", "--name", "Nr3", "--port", "10007"])
            .expect("parse");
        assert!(args.worker);
        assert_eq!(args.name, "Nr3");
        assert_eq!(args.addr(), SocketAddr::from(([127, 0, 0, 1], 10007)));
        let config = args.coordinator_config();
        assert!(config.remote);
        assert!(config.pool.is_none());
        assert_eq!(config.monitor.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn port_is_required() {
        assert!(WorkerArgs::try_parse_from(["palisade-worker", "--name", "Nr1"]).is_err());
    }
}
