//! CLI argument parsing for the calltrace replay host

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the finished trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Indented call tree (default)
    Text,
    /// Full JSON report: document, search index and summary
    Json,
    /// JSON call skeleton without line events
    Skeleton,
}

#[derive(Parser, Debug)]
#[command(name = "calltrace")]
#[command(version)]
#[command(about = "Replay a recorded frame-event stream into a call-tree trace", long_about = None)]
pub struct Cli {
    /// Recorded events, one JSON object per line
    #[arg(value_name = "EVENTS")]
    pub input: PathBuf,

    /// Trace configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Include glob (repeatable; added to the config file's patterns)
    #[arg(short = 'i', long = "include", value_name = "GLOB")]
    pub include: Vec<String>,

    /// Function name never recorded (repeatable)
    #[arg(short = 'x', long = "exclude-function", value_name = "NAME")]
    pub exclude_functions: Vec<String>,

    /// Record changed local variables on each line
    #[arg(long = "var-trace")]
    pub var_trace: bool,

    /// Defer capture until FILE:LINE executes
    #[arg(long = "start-at", value_name = "FILE:LINE")]
    pub start_at: Option<String>,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Write output to a file instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}
