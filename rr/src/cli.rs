//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::domain::{ClientType, JobStatus, TaskStatus};

/// rr - job, client and task records with live views
#[derive(Parser, Debug)]
#[command(name = "rr", author, version, about = "Job, client and task records with live views", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// SQLite store to use instead of the configured one
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage clients
    Client {
        #[command(subcommand)]
        command: ClientCommand,
    },

    /// Manage jobs
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Follow a live view and print its state transitions
    Watch {
        /// What to watch
        #[arg(value_enum)]
        target: WatchTarget,

        /// Restrict tasks to one job
        #[arg(short, long)]
        job: Option<String>,

        /// Stop after this many seconds
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Create a client
    Add {
        /// Client name
        name: String,

        /// residential or business
        #[arg(short = 't', long = "type", default_value = "residential")]
        client_type: ClientType,

        #[arg(short, long)]
        email: Option<String>,

        #[arg(short, long)]
        phone: Option<String>,
    },

    /// List clients
    List {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    /// Create a job for a client
    Add {
        /// Owning client id
        #[arg(long)]
        client: String,

        /// Job title
        title: String,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(short, long, default_value = "open")]
        status: JobStatus,
    },

    /// List jobs
    List {
        /// Only jobs of this client
        #[arg(long)]
        client: Option<String>,

        /// Only jobs with this status
        #[arg(short, long)]
        status: Option<JobStatus>,

        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one job with its client and tasks
    Show {
        id: String,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Update fields of a job
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(short, long)]
        status: Option<JobStatus>,
    },

    /// Soft-delete a job
    Discard { id: String },

    /// Restore a discarded job
    Undiscard { id: String },

    /// Permanently delete a job
    Destroy { id: String },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Append a task to a job
    Add {
        /// Owning job id
        #[arg(short, long)]
        job: String,

        /// Task title
        title: String,

        /// Nest under this task
        #[arg(short, long)]
        parent: Option<String>,

        #[arg(short, long, default_value = "pending")]
        status: TaskStatus,
    },

    /// List the tasks of a job as a tree
    List {
        #[arg(short, long)]
        job: String,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Move a task to a new slot, optionally under a new parent
    Move {
        id: String,

        /// Zero-based slot among the new siblings
        #[arg(short, long)]
        index: usize,

        /// New parent task (omit for top level)
        #[arg(short, long)]
        parent: Option<String>,
    },
}

/// Discard scope selection shared by list commands
#[derive(clap::Args, Debug, Clone, Copy, Default)]
pub struct ScopeArgs {
    /// Only discarded records
    #[arg(long, conflicts_with = "all")]
    pub discarded: bool,

    /// Kept and discarded records
    #[arg(long)]
    pub all: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    Jobs,
    Tasks,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_job_add() {
        let cli = Cli::try_parse_from(["rr", "job", "add", "--client", "c1", "Fix sink", "--status", "in_progress"]).unwrap();
        match cli.command {
            Command::Job {
                command: JobCommand::Add { client, title, status, .. },
            } => {
                assert_eq!(client, "c1");
                assert_eq!(title, "Fix sink");
                assert_eq!(status, JobStatus::InProgress);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_scope_flags_conflict() {
        assert!(Cli::try_parse_from(["rr", "client", "list", "--all", "--discarded"]).is_err());
    }

    #[test]
    fn test_global_store_flag() {
        let cli = Cli::try_parse_from(["rr", "client", "list", "--store", "/tmp/rr.db"]).unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/rr.db")));
    }

    #[test]
    fn test_rejects_unknown_client_type() {
        assert!(Cli::try_parse_from(["rr", "client", "add", "Acme", "--type", "corporate"]).is_err());
    }
}
