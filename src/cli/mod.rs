use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::ssh::known_hosts::HostKeyMode;

pub mod deploy;
pub mod destroy;
pub mod drift_cmd;
pub mod env_cmd;
pub mod history;
pub mod init;
pub mod ps;
pub mod rollback;
pub mod scale;
pub mod service_cmd;
pub mod state_cmd;

#[derive(Parser)]
#[command(name = "tako", version, about = "Deploy Docker services to your own servers over SSH")]
pub struct Cli {
    /// Path to tako.yaml or tako.json (discovered by name if omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Target environment
    #[arg(short, long, global = true, default_value = "production")]
    pub env: String,

    /// Restrict the operation to one configured server
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Host key verification policy
    #[arg(long, global = true, value_enum, default_value_t = HostKeyMode::Tofu)]
    pub host_key_mode: HostKeyMode,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scaffold tako.yaml in the current directory
    Init,

    /// Build, reconcile and roll out the configured services
    Deploy {
        /// Use existing images, skip the build step
        #[arg(long)]
        skip_build: bool,
        /// Apply destructive plans without prompting
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Roll back to a previous deployment
    Rollback {
        /// Deployment id to restore (defaults to the previous success)
        id: Option<String>,
    },

    /// Change replica counts (SERVICE=N ...)
    Scale {
        /// One or more SERVICE=N pairs
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Stop services, keeping their configuration for `start`
    Stop {
        /// Stop only this service
        #[arg(long)]
        service: Option<String>,
    },

    /// Start previously stopped services
    Start {
        /// Start only this service
        #[arg(long)]
        service: Option<String>,
    },

    /// Show observed services and their health
    Ps,

    /// List deployment history
    History {
        /// Number of records to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        /// Filter by status (success, failed, rolled_back, in_progress)
        #[arg(long)]
        status: Option<String>,
    },

    /// Inspect and synchronize deployment state
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Compare live state against the configuration
    Drift {
        /// Keep watching at an interval
        #[arg(long)]
        watch: bool,
        /// Polling interval in seconds
        #[arg(long, default_value = "300")]
        interval: u64,
    },

    /// Move the encrypted environment bundle to or from the manager
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// Remove deployed services (and optionally all data)
    Destroy {
        /// Also remove volumes and remote state, with a backup first
        #[arg(long)]
        purge_all: bool,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum StateAction {
    /// Fetch remote history to the local store, repairing from workers if
    /// the manager lost it
    Pull,
    /// Show local and remote history status
    Status,
    /// Write the local state directory to an encrypted file
    Export {
        /// Output file
        #[arg(short, long, default_value = "tako-state.enc")]
        output: PathBuf,
    },
    /// Restore a previously exported state file
    Import {
        /// Input file
        input: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum EnvAction {
    /// Encrypt local env files and upload the bundle to the manager
    Push,
    /// Download and decrypt the bundle from the manager
    Pull,
}
