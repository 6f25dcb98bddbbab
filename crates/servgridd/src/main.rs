//! servgridd: the ServGrid daemon.
//!
//! Runs one orchestrator node:
//! - State store (redb)
//! - Service registry, factory and lifecycle
//! - Heartbeat agent and tick loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! servgridd run --config node.toml --api-port 2812
//! servgridd check-config --config node.toml
//! ```

mod standalone;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use servgrid_core::NodeConfig;

#[derive(Parser)]
#[command(name = "servgridd", about = "ServGrid daemon")]
struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a standalone node (head of its own cluster).
    Run {
        /// Node configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured API port.
        #[arg(long)]
        api_port: Option<u16>,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    match cli.command {
        Command::Run { config, api_port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = api_port {
                config.api.port = port;
            }
            standalone::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "servgridd",
            "--log-format",
            "json",
            "run",
            "--config",
            "node.toml",
            "--api-port",
            "9000",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Run { config, api_port } => {
                assert_eq!(config, Some(PathBuf::from("node.toml")));
                assert_eq!(api_port, Some(9000));
            }
            Command::CheckConfig { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn check_config_requires_a_file() {
        assert!(Cli::try_parse_from(["servgridd", "check-config"]).is_err());
    }

    #[test]
    fn config_file_is_loaded_and_validated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.toml");

        std::fs::write(&path, "node_id = \"eu-1\"\nmax_memory_mb = 4096\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.node_id, "eu-1");
        assert_eq!(config.max_memory_mb, 4096);
        assert_eq!(config.start_timeout_secs, 20);

        std::fs::write(&path, "node_id = \"bad id\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
