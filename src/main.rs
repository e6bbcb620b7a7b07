use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufReader;

use calltrace::cli::{Cli, OutputFormat};
use calltrace::config::TraceConfig;
use calltrace::document::{CallNode, CallResult, TraceEntry};
use calltrace::json_output::TraceReport;
use calltrace::replay::replay_session;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Parse `FILE:LINE`
fn parse_start_at(location: &str) -> Result<(String, u32)> {
    let Some((file, line)) = location.rsplit_once(':') else {
        bail!("Invalid value for --start-at: {} (expected FILE:LINE)", location);
    };
    let line = line
        .parse::<u32>()
        .with_context(|| format!("Invalid line number in --start-at: {}", location))?;
    Ok((file.to_string(), line))
}

fn build_config(args: &Cli) -> Result<TraceConfig> {
    let mut config = match &args.config {
        Some(path) => TraceConfig::from_toml(path)?,
        None => TraceConfig::default(),
    };
    for pattern in &args.include {
        config = config.with_include(pattern.clone());
    }
    for name in &args.exclude_functions {
        config = config.with_excluded_function(name.clone());
    }
    if args.var_trace {
        config = config.with_var_trace(true);
    }
    if let Some(location) = &args.start_at {
        let (file, line) = parse_start_at(location)?;
        config = config.with_start_trigger(file, line);
    }
    config.validate()?;
    Ok(config)
}

fn write_call(out: &mut String, call: &CallNode, indent: usize) {
    let pad = "  ".repeat(indent);
    let outcome = match &call.result {
        CallResult::Returned { value } => format!("-> {}", value),
        CallResult::Unwound => "[unwound]".to_string(),
        CallResult::NotReturned => "[not returned]".to_string(),
    };
    let _ = writeln!(
        out,
        "{}{} ({}:{}) {}",
        pad,
        call.display_name(),
        call.display_file,
        call.line,
        outcome
    );

    for child in &call.children {
        match child {
            TraceEntry::Call(node) => write_call(out, node, indent + 1),
            TraceEntry::Line(line) => {
                let vars: Vec<String> = line
                    .variables
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect();
                let _ = writeln!(out, "{}  | {} {}", pad, line.line, vars.join(" "));
            }
            TraceEntry::Exception(exc) => {
                let _ = writeln!(
                    out,
                    "{}  ! {}: {} (line {})",
                    pad, exc.type_name, exc.message, exc.line
                );
            }
        }
    }
}

fn text_output(report: &TraceReport) -> String {
    let mut out = String::new();
    for call in &report.trace.calls {
        write_call(&mut out, call, 0);
    }
    let s = &report.summary;
    let _ = writeln!(
        out,
        "--- {} calls, {} lines, {} exceptions, max depth {}, {} threads, {} errors",
        s.total_calls, s.total_lines, s.total_exceptions, s.max_depth, s.threads, s.errors
    );
    out
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = build_config(&args)?;
    let file = File::open(&args.input)
        .with_context(|| format!("Failed to open event stream: {}", args.input.display()))?;
    let (report, _stats) = replay_session(config, BufReader::new(file))?;

    let output = match args.format {
        OutputFormat::Text => text_output(&report),
        OutputFormat::Json => report.to_json()?,
        OutputFormat::Skeleton => report.skeleton_json()?,
    };

    match &args.output {
        Some(path) => fs::write(path, output)
            .with_context(|| format!("Failed to write output: {}", path.display()))?,
        None => println!("{}", output.trim_end()),
    }
    Ok(())
}
