// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `dagrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagrun",
    version,
    about = "Run a task graph in parallel with result caching.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Dagrun.toml` in the current working directory. Its
    /// directory is the workspace root.
    #[arg(long, value_name = "PATH", default_value = "Dagrun.toml")]
    pub config: String,

    /// Number of concurrent execution slots (overrides `[config].parallel`).
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Stop dispatching new tasks after the first failure.
    #[arg(long)]
    pub bail: bool,

    /// Neither read nor write the result cache.
    #[arg(long)]
    pub skip_cache: bool,

    /// Project the user is working on; its tasks stream output live.
    #[arg(long, value_name = "NAME")]
    pub project: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGRUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the task graph, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Write a Chrome trace profile of the run to FILE.
    #[arg(long, value_name = "FILE")]
    pub profile: Option<PathBuf>,

    /// Print per-task durations as JSON when the run ends.
    #[arg(long)]
    pub timings: bool,

    /// Pass verbose mode to executors.
    #[arg(long)]
    pub verbose: bool,
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
