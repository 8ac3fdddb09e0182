use anyhow::{Context, Result};
use canopy_collab::{CollabServer, ServerConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "canopy-server")]
#[command(about = "Canopy real-time collaboration server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB data directory; state is kept in memory when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seconds without a heartbeat before a user is reported offline
    #[arg(long, default_value_t = 30)]
    presence_timeout: u64,

    /// Seconds between presence sweeps
    #[arg(long, default_value_t = 5)]
    sweep_interval: u64,

    /// Events buffered per subscriber before it must catch up from the log
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between WebSocket pings
    #[arg(long, default_value_t = 15)]
    ping_interval: u64,

    /// Deliver a connection's own operations back to it
    #[arg(long)]
    echo_own_operations: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig {
            bind_addr: self.bind,
            heartbeat_interval_secs: self.ping_interval,
            storage_path: self.data_dir,
            ..ServerConfig::default()
        };
        config.collab.presence.timeout = Duration::from_secs(self.presence_timeout);
        config.collab.presence.sweep_interval = Duration::from_secs(self.sweep_interval);
        config.collab.broadcast_capacity = self.broadcast_capacity;
        config.collab.echo_own_operations = self.echo_own_operations;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Cli::parse().into_config();
    match &config.storage_path {
        Some(path) => log::info!("Using persistent storage at {}", path.display()),
        None => log::info!("Using in-memory storage"),
    }
    let server = CollabServer::new(config).context("failed to open storage")?;

    tokio::select! {
        result = server.run() => result.map_err(|e| anyhow::anyhow!(e))?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let config = Cli::try_parse_from(["canopy-server"]).unwrap().into_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.heartbeat_interval_secs, defaults.heartbeat_interval_secs);
        assert!(config.storage_path.is_none());
        assert_eq!(config.collab.presence.timeout, defaults.collab.presence.timeout);
        assert_eq!(config.collab.broadcast_capacity, defaults.collab.broadcast_capacity);
    }

    #[test]
    fn test_flags_map_onto_config() {
        let cli = Cli::try_parse_from([
            "canopy-server",
            "--bind",
            "0.0.0.0:7000",
            "--data-dir",
            "/var/lib/canopy",
            "--presence-timeout",
            "10",
            "--sweep-interval",
            "2",
            "--broadcast-capacity",
            "1024",
            "--echo-own-operations",
        ])
        .unwrap();
        let config = cli.into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/canopy")));
        assert_eq!(config.collab.presence.timeout, Duration::from_secs(10));
        assert_eq!(config.collab.presence.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.collab.broadcast_capacity, 1024);
        assert!(config.collab.echo_own_operations);
    }
}
