//! CLI definitions for cadence.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// cadence: runs executables on schedules and records what they report.
#[derive(Debug, Parser)]
#[command(name = "cadence")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log line format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler in the foreground until SIGTERM or SIGINT
    Daemon,

    /// Run one configured task now, outside its schedule
    Run {
        /// Task name
        task: String,

        /// File whose contents replace the task's parameters on stdin ("-" for our stdin)
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Persist the execution to the result store
        #[arg(long)]
        record: bool,

        /// Also write the raw stdout of the task here
        #[arg(long)]
        stdout: Option<PathBuf>,

        /// Also write the captured stderr of the task here
        #[arg(long)]
        stderr: Option<PathBuf>,
    },

    /// Run an arbitrary program under the task contract
    Exec {
        /// Timeout in seconds (default: the configured task default)
        #[arg(long)]
        timeout: Option<u64>,

        /// File written to the program's stdin ("-" for our stdin)
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Program, resolved against the configured PATH
        program: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Query and maintain recorded executions
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Validate the configuration and print each task's next due instant
    Check,
}

#[derive(Debug, Subcommand)]
pub(crate) enum HistoryAction {
    /// List executions, oldest first
    List {
        #[arg(long)]
        task: Option<String>,

        /// succeeded, failed, timed_out or crashed
        #[arg(long)]
        status: Option<String>,

        /// Only executions started at or after this RFC 3339 instant
        #[arg(long)]
        since: Option<String>,

        /// Only executions started before this RFC 3339 instant
        #[arg(long)]
        until: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// One JSON document per line instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print one execution in full
    Show {
        /// Execution id
        id: String,
    },

    /// Delete executions older than the given age
    Purge {
        #[arg(long)]
        older_than_days: u32,
    },

    /// List firings skipped because the previous one was still running
    Skips {
        #[arg(long)]
        task: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exec_keeps_program_flags() {
        let cli = Cli::parse_from(["cadence", "exec", "--timeout", "3", "ls", "-la", "/tmp"]);
        match cli.command {
            Commands::Exec {
                timeout,
                program,
                args,
                ..
            } => {
                assert_eq!(timeout, Some(3));
                assert_eq!(program, "ls");
                assert_eq!(args, vec!["-la", "/tmp"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::parse_from([
            "cadence",
            "history",
            "list",
            "--task",
            "backup",
            "--log-format",
            "json",
            "-c",
            "/etc/cadence.toml",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config.as_deref(), Some("/etc/cadence.toml"));
        assert!(matches!(
            cli.command,
            Commands::History {
                action: HistoryAction::List { .. }
            }
        ));
    }
}
