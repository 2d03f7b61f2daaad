use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bring up replica sets and sharded clusters for testing.
#[derive(Debug, Parser)]
#[command(name = "fleet", version, about)]
pub struct Cli {
    /// Root for data directories and logs; overrides the topology file.
    #[arg(long, global = true, env = "FLEET_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Server binary to launch.
    #[arg(long, global = true, env = "FLEET_SERVER_BIN")]
    pub server_bin: Option<PathBuf>,

    /// Router binary to launch.
    #[arg(long, global = true, env = "FLEET_ROUTER_BIN")]
    pub router_bin: Option<PathBuf>,

    /// Bridge binary to launch.
    #[arg(long, global = true, env = "FLEET_BRIDGE_BIN")]
    pub bridge_bin: Option<PathBuf>,

    /// Output as JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse and validate a topology file.
    Validate {
        /// Path to the topology file.
        #[arg(short = 'f', long = "file", default_value = "./fleet.hcl")]
        file: PathBuf,
    },

    /// Start a replica set or sharded cluster and keep it up until Ctrl-C.
    Up {
        /// Name of a `replica_set` or `sharded_cluster` block.
        name: String,

        /// Path to the topology file.
        #[arg(short = 'f', long = "file", default_value = "./fleet.hcl")]
        file: PathBuf,
    },

    /// Show replica set status as seen by one member.
    Status {
        /// Member address (host:port).
        #[arg(long)]
        host: String,
    },

    /// Ask a primary to step down.
    StepDown {
        /// Primary address (host:port).
        #[arg(long)]
        host: String,

        /// Seconds the old primary stays ineligible.
        #[arg(long, default_value_t = 60)]
        secs: u64,

        /// Step down even without a caught-up secondary.
        #[arg(long)]
        force: bool,
    },
}
