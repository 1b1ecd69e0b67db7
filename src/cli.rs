// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `planloop`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "planloop",
    version,
    about = "Execute a plan of tasks and events described in a TOML plan file.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the plan file (TOML).
    ///
    /// Default: `Plan.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Plan.toml")]
    pub config: String,

    /// Stop after this many engine cycles. Overrides `[engine].max_cycles`.
    #[arg(long, value_name = "N")]
    pub max_cycles: Option<u64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PLANLOOP_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the plan, but don't run the engine.
    #[arg(long)]
    pub dry_run: bool,
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
