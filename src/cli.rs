// src/cli.rs

//! CLI argument parsing using `clap`.

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};

/// Command-line arguments for `jobgraph`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobgraph",
    version,
    about = "Run security-group reconciliation jobs on a persistent DAG scheduler.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Jobgraph.toml` in the current working directory. A missing
    /// default file means built-in defaults.
    #[arg(long, value_name = "PATH", default_value = "Jobgraph.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `JOBGRAPH_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Build and print the reconciliation graph, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Number of members of the demo security group.
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub members: usize,

    /// Number of interfaces (policy bindings) of the demo security group.
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub interfaces: usize,

    /// Mark the demo security group for deletion, so the job tears it down.
    #[arg(long)]
    pub delete: bool,

    /// Rebuild unfinished jobs from the store and run them instead of
    /// submitting a new one.
    #[arg(long)]
    pub resume: bool,

    /// Print the failure histogram from the store and exit.
    ///
    /// Takes an RFC 3339 timestamp, or `all`.
    #[arg(long, value_name = "RFC3339|all", value_parser = parse_since)]
    pub failures_since: Option<FailureWindow>,
}

/// Time window of the failure histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureWindow {
    All,
    Since(DateTime<Utc>),
}

impl FailureWindow {
    pub fn start(self) -> Option<DateTime<Utc>> {
        match self {
            FailureWindow::All => None,
            FailureWindow::Since(t) => Some(t),
        }
    }
}

fn parse_since(s: &str) -> Result<FailureWindow, String> {
    if s.trim().eq_ignore_ascii_case("all") {
        return Ok(FailureWindow::All);
    }
    DateTime::parse_from_rfc3339(s.trim())
        .map(|t| FailureWindow::Since(t.with_timezone(&Utc)))
        .map_err(|e| format!("invalid timestamp '{s}': {e}"))
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
