//! # CLI Interface
//!
//! Command-line arguments for `basalt-node`, via `clap` derive. Every `run`
//! flag also reads a `BASALT_*` environment variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use basalt_protocol::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT, DEFAULT_P2P_PORT};

use crate::logging::LogFormat;

/// Basalt blockchain node.
#[derive(Parser, Debug)]
#[command(
    name = "basalt-node",
    about = "Basalt blockchain node",
    version,
    propagate_version = true
)]
pub struct BasaltNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a node.
    Run(RunArgs),
    /// Generate a validator key and print it as hex.
    Keygen,
    /// Run a three-node in-process network that produces blocks from
    /// sample contract transactions.
    Demo(DemoArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Address for the P2P listener.
    #[arg(long, env = "BASALT_LISTEN_ADDR", default_value_t = format!("0.0.0.0:{DEFAULT_P2P_PORT}"))]
    pub listen_addr: String,

    /// Peers to dial on startup (`host:port`), comma separated.
    #[arg(long, env = "BASALT_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// Seconds between block production ticks.
    #[arg(long, env = "BASALT_BLOCK_TIME", default_value_t = 5)]
    pub block_time: u64,

    /// Hex-encoded Ed25519 validator key. Makes this node a validator.
    #[arg(long, env = "BASALT_VALIDATOR_KEY", conflicts_with = "generate_key")]
    pub validator_key: Option<String>,

    /// Generate a throwaway validator key for this run.
    #[arg(long)]
    pub generate_key: bool,

    /// Port for the HTTP API.
    #[arg(long, env = "BASALT_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "BASALT_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Directory for the on-disk block store. Blocks are kept in memory
    /// only when omitted.
    #[arg(long, short = 'd', env = "BASALT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, env = "BASALT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Arguments for the `demo` subcommand.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Seconds between block production ticks on the validator.
    #[arg(long, default_value_t = 1)]
    pub block_time: u64,

    /// Blocks to wait for before stopping.
    #[arg(long, default_value_t = 5)]
    pub blocks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        BasaltNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults_and_seed_list() {
        let cli = BasaltNodeCli::parse_from([
            "basalt-node",
            "run",
            "--seeds",
            "10.0.0.1:3000,10.0.0.2:3000",
            "--generate-key",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.seeds, vec!["10.0.0.1:3000", "10.0.0.2:3000"]);
        assert_eq!(args.block_time, 5);
        assert_eq!(args.api_port, DEFAULT_API_PORT);
        assert!(args.generate_key);
        assert!(args.data_dir.is_none());
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn key_flags_conflict() {
        let parsed = BasaltNodeCli::try_parse_from([
            "basalt-node",
            "run",
            "--validator-key",
            "00",
            "--generate-key",
        ]);
        assert!(parsed.is_err());
    }
}
