//! Command line interface.
//!
//! `run` starts the agent loops, `submit` validates a workflow file,
//! `status` prints catalog counts and agent health, and `demo` drives one
//! workflow through the whole lifecycle in-process.

use clap::{Parser, Subcommand};

/// iDDS core — request/transform/processing orchestration agents.
#[derive(Debug, Parser)]
#[command(name = "idds", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (default: ./idds.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Enable verbose (debug-level) logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start all agents and run until interrupted.
    Run,

    /// Validate a workflow JSON file and print the request it would queue.
    Submit {
        /// Path to the workflow JSON file.
        file: String,

        /// Scope the request belongs to.
        #[arg(long, default_value = "user")]
        scope: String,

        /// Request name.
        #[arg(long, default_value = "request")]
        name: String,

        /// External workload id for duplicate detection.
        #[arg(long)]
        workload_id: Option<u64>,

        /// Request priority.
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Days until the request expires and is force-failed.
        #[arg(long, default_value_t = 30)]
        lifetime_days: i64,
    },

    /// Print catalog counts and agent heartbeats.
    Status,

    /// Run a built-in workflow end to end against the local backend.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn parses_run() {
        let cli = Cli::parse_from(["idds", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert!(!cli.verbose);
    }

    #[test]
    fn parses_submit_with_options() {
        let cli = Cli::parse_from([
            "idds",
            "submit",
            "workflow.json",
            "--scope",
            "user.test",
            "--workload-id",
            "99",
            "--priority",
            "5",
        ]);
        match cli.command {
            Command::Submit {
                file,
                scope,
                workload_id,
                priority,
                lifetime_days,
                ..
            } => {
                assert_eq!(file, "workflow.json");
                assert_eq!(scope, "user.test");
                assert_eq!(workload_id, Some(99));
                assert_eq!(priority, 5);
                assert_eq!(lifetime_days, 30);
            }
            _ => panic!("expected Submit command"),
        }
    }

    #[test]
    fn parses_global_flags() {
        let cli = Cli::parse_from(["idds", "--verbose", "--config", "/etc/idds.toml", "demo"]);
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("/etc/idds.toml"));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
