use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tau_process_types::ProcessStatus;
use uuid::Uuid;

fn parse_status(value: &str) -> Result<ProcessStatus, String> {
    value
        .parse::<ProcessStatus>()
        .map_err(|error| error.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "tau-procctl",
    about = "Inspect and maintain the process queue and snapshot store",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "TAU_PROCESS_CONFIG",
        help = "JSON config file; defaults apply when omitted"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "TAU_PROCESS_DB",
        help = "Overrides database_path from the config"
    )]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ProcCtlCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub(crate) enum ProcCtlCommand {
    /// List processes, oldest first.
    List {
        #[arg(long)]
        project: Option<Uuid>,
        #[arg(long = "status", value_parser = parse_status)]
        statuses: Vec<ProcessStatus>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        parent: Option<Uuid>,
        #[arg(long = "exclusive-group")]
        exclusive_group: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one process and its snapshot summary.
    Show { instance_id: Uuid },
    /// Print the status history, or the full audit log with --audit.
    History {
        instance_id: Uuid,
        #[arg(long)]
        audit: bool,
    },
    /// Cancel a process and all of its non-terminal descendants.
    Kill { instance_id: Uuid },
    /// Write a process snapshot into a directory.
    Export {
        instance_id: Uuid,
        target_dir: PathBuf,
    },
    /// Import a directory into a process snapshot.
    Import {
        instance_id: Uuid,
        source_dir: PathBuf,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Delete old terminal processes and stale snapshots.
    Prune {
        #[arg(long = "older-than-secs")]
        older_than_secs: Option<u64>,
        #[arg(long = "keep-snapshots")]
        keep_snapshots: bool,
    },
}
