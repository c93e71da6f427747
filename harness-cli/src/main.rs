//! # nkfs-harness
//!
//! Integration test driver for the nkfs distributed object store.
//!
//! ## Commands
//!
//! - `cluster`: provision remote nodes over SSH, mesh them, run the integrity suite
//! - `local`: run the integrity suite against one server on loop devices
//!
//! ## Example
//!
//! ```bash
//! # Three-node cluster, password auth
//! nkfs-harness cluster 10.0.0.1 10.0.0.2 10.0.0.3 --device /dev/sdb --password secret
//!
//! # Lifecycle only, no workloads
//! nkfs-harness cluster 10.0.0.1 10.0.0.2 --key-file ~/.ssh/id_ed25519 --skip-workloads
//!
//! # Loopback run reusing loaded modules
//! nkfs-harness local --noloadmods --project-dir ~/src/nkfs
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod commands;
mod logging;

use commands::{cluster, local};

/// Integration test driver for nkfs.
#[derive(Parser, Debug)]
#[command(name = "nkfs-harness")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory receiving logs, per-node artifacts and scratch files
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the integrity workload.
#[derive(Args, Debug, Clone, Default)]
pub struct WorkloadArgs {
    /// Concurrent workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Files generated per worker
    #[arg(long)]
    pub file_count: Option<usize>,

    /// Smallest generated file, in bytes
    #[arg(long)]
    pub min_size: Option<u64>,

    /// Largest generated file, in bytes
    #[arg(long)]
    pub max_size: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision, start and mesh remote nodes, then run the integrity suite
    Cluster {
        /// Node addresses
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Backing device to attach on every node (repeatable)
        #[arg(long = "device", short)]
        devices: Vec<String>,

        /// SSH user
        #[arg(long, short, default_value = "root")]
        user: String,

        /// SSH password (uses sshpass)
        #[arg(long, short, conflicts_with = "key_file")]
        password: Option<String>,

        /// SSH private key
        #[arg(long, conflicts_with = "password")]
        key_file: Option<PathBuf>,

        /// Seconds to wait for heartbeats after meshing
        #[arg(long)]
        settle_secs: Option<u64>,

        /// Register neighbors in both directions
        #[arg(long)]
        bidirectional: bool,

        /// Run only the lifecycle, no test cases
        #[arg(long)]
        skip_workloads: bool,

        #[command(flatten)]
        workload: WorkloadArgs,
    },

    /// Run the integrity suite against one local server on loop devices
    Local {
        /// Reuse already-loaded kernel modules
        #[arg(long)]
        noloadmods: bool,

        /// Server bind address
        #[arg(long)]
        bind: Option<String>,

        /// Server external address
        #[arg(long)]
        external: Option<String>,

        /// nkfs source tree holding bin/
        #[arg(long)]
        project_dir: Option<PathBuf>,

        #[command(flatten)]
        workload: WorkloadArgs,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = commands::load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.artifact_dir {
        config.cluster.artifact_dir = dir;
    }

    match cli.command {
        Commands::Cluster {
            addresses,
            devices,
            user,
            password,
            key_file,
            settle_secs,
            bidirectional,
            skip_workloads,
            workload,
        } => {
            let options = cluster::ClusterOptions {
                addresses,
                devices,
                user,
                password,
                key_file,
                settle_secs,
                bidirectional,
                skip_workloads,
                workload,
            };
            cluster::run(config, options, cli.verbose).await
        }
        Commands::Local {
            noloadmods,
            bind,
            external,
            project_dir,
            workload,
        } => {
            let options = local::LocalOptions {
                noloadmods,
                bind,
                external,
                project_dir,
                workload,
            };
            local::run(config, options, cli.verbose).await
        }
    }
}
