//! ferry - resumable, rate-limited bulk copy and move.
//!
//! Usage:
//!   ferry copy SOURCE... DEST    Copy files and directories into DEST
//!   ferry move SOURCE... DEST    Move files and directories into DEST
//!   ferry size PATH...           Show the size of paths
//!   ferry --help                 Show help

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use tokio_stream::StreamExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ferry_core::{Behavior, EngineConfig, OperationId, OperationKind, OperationStatus};
use ferry_ops::{Engine, Event, EventEnvelope, OperationEvents};

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Resumable, rate-limited bulk copy and move",
    long_about = "ferry copies and moves files as long-running operations.\n\n\
                  Directories are expanded into their files, transfers can be \
                  throttled, and conflicts are resolved per file."
)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv). FERRY_LOG overrides it.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy sources into a destination directory
    Copy(TransferArgs),

    /// Move sources into a destination directory
    Move(TransferArgs),

    /// Show the total size of paths
    Size {
        /// Paths to measure
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Source files or directories, followed by the destination directory
    #[arg(required = true, num_args = 2..)]
    paths: Vec<PathBuf>,

    /// Throughput limit (e.g., "500KB", "10MB"), per second
    #[arg(short, long)]
    rate_limit: Option<String>,

    /// What to do when a destination already exists
    #[arg(long, default_value = "abort")]
    on_conflict: ConflictPolicy,

    /// Skip entries whose name matches this glob (repeatable)
    #[arg(short, long)]
    ignore: Vec<String>,

    /// Print every event as a JSON line instead of progress text
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum ConflictPolicy {
    /// Stop the whole operation
    #[default]
    Abort,
    /// Keep the existing file
    Skip,
    /// Overwrite the existing file
    Replace,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;

    match cli.command {
        Command::Copy(args) => {
            runtime.block_on(run_transfer(OperationKind::Copy, args, &mut config))
        }
        Command::Move(args) => {
            runtime.block_on(run_transfer(OperationKind::Move, args, &mut config))
        }
        Command::Size { paths } => runtime.block_on(run_size(paths, config)),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "ferry=warn",
        1 => "ferry=info",
        2 => "ferry=debug",
        _ => "ferry=trace",
    };
    let filter = EnvFilter::try_from_env("FERRY_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

/// Run one copy or move to completion, printing progress.
async fn run_transfer(
    kind: OperationKind,
    args: TransferArgs,
    config: &mut EngineConfig,
) -> Result<()> {
    let mut paths = args.paths;
    let destination = paths.pop().ok_or_else(|| eyre!("Missing destination"))?;
    let destination = std::path::absolute(&destination).context("Invalid destination")?;
    let sources = paths
        .iter()
        .map(|p| p.canonicalize().with_context(|| format!("Invalid source {}", p.display())))
        .collect::<Result<Vec<_>>>()?;

    if let Some(limit) = &args.rate_limit {
        config.default_rate_limit = parse_size(limit)?;
    }
    config.walk.ignore_patterns.extend(args.ignore);

    let engine = Engine::local(config.clone())?;
    let writer = engine.connect();
    let id = engine.create(writer.id(), kind, &sources, &destination).await?;

    match args.on_conflict {
        ConflictPolicy::Abort => {}
        ConflictPolicy::Skip => engine.set_behavior(id, Behavior::Skip, true)?,
        ConflictPolicy::Replace => engine.set_behavior(id, Behavior::Replace, true)?,
    }

    let operation = engine.get(id)?;
    let total = engine.size(id)?;
    if !args.json {
        eprintln!(
            "{} {} entries ({}) to {}",
            match kind {
                OperationKind::Copy => "Copying",
                OperationKind::Move => "Moving",
            },
            operation.sources.len(),
            format_size(total),
            destination.display()
        );
        for line in &operation.log {
            eprintln!("{}", line);
        }
    }

    let events = engine.subscribe_operation(id);
    engine.start(id)?;

    let outcome = follow(&engine, id, events, |envelope| {
        if args.json {
            println!("{}", serde_json::to_string(envelope)?);
        }

        match &envelope.event {
            Event::OperationProgress { index, size, .. } if !args.json => {
                if let Some(entry) = operation.sources.get(*index) {
                    eprint!(
                        "\r[{}/{}] {} {}/{}    ",
                        index + 1,
                        operation.sources.len(),
                        entry.path.display(),
                        format_size(*size),
                        format_size(entry.size)
                    );
                }
            }
            Event::OperationLog { text, .. } if !args.json => {
                eprintln!("\r{}", text);
            }
            Event::OperationError { error, .. } => {
                if !args.json {
                    eprintln!("\rError: {}", error);
                }
                // Nothing will resolve the conflict without a policy.
                if engine.get(id).is_ok_and(|op| op.error.is_some()) {
                    engine.cancel(id)?;
                }
            }
            _ => {}
        }
        Ok(())
    })
    .await?;
    drop(writer);

    match outcome {
        Some((OperationStatus::Finished, 0)) => {
            if !args.json {
                eprintln!("Done: {}", format_size(total));
            }
            Ok(())
        }
        Some((OperationStatus::Finished, skipped)) => {
            bail!("Operation finished, but {} requested paths were not transferred", skipped)
        }
        Some((status, _)) => bail!("Operation ended {}", status),
        None => bail!("Lost track of the operation after missing its final events"),
    }
}

/// Feed every event of `id` to `on_event` until the operation is done.
///
/// Returns the final status and the number of skipped paths, or `None` when
/// lag dropped the final events of an operation that is already gone.
async fn follow<F>(
    engine: &Engine,
    id: OperationId,
    mut events: OperationEvents,
    mut on_event: F,
) -> Result<Option<(OperationStatus, usize)>>
where
    F: FnMut(&EventEnvelope) -> Result<()>,
{
    let mut outcome = None;
    while let Some(item) = events.next().await {
        let envelope = match item {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(target: "ferry::cli", "{}", err);
                if engine.get(id).is_err() {
                    break;
                }
                continue;
            }
        };

        on_event(&envelope)?;
        if let Event::OperationDone { status, skipped, .. } = envelope.event {
            outcome = Some((status, skipped));
        }
    }
    Ok(outcome)
}

/// Print the size of each path.
async fn run_size(paths: Vec<PathBuf>, config: EngineConfig) -> Result<()> {
    let engine = Engine::local(config)?;
    let mut total = 0u64;
    for path in &paths {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("Invalid path {}", path.display()))?;
        let size = engine.size_of(&absolute).await?;
        total += size;
        println!("{:>10}  {}", format_size(size), path.display());
    }
    if paths.len() > 1 {
        println!("{:>10}  total", format_size(total));
    }
    Ok(())
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Parse a size string (e.g., "1KB", "10MB", "1GB").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
    let unit = &s[digits.len()..];

    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => bail!("Unknown size unit: {}", other),
    };
    let num: f64 = digits
        .parse()
        .with_context(|| format!("Invalid size: {}", s))?;

    Ok((num * multiplier as f64) as u64)
}
