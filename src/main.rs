//! CLI Entry Point for dmf-chip-qc
//!
//! Provides command-line interface for:
//! - Planning a test route from a chip graph and waypoints
//! - Running the test routine against the simulated liquid mover, or
//!   resuming an interrupted test from its event log
//! - Re-summarizing a persisted JSON-lines event log
//!
//! # Usage
//!
//! ```bash
//! dmf-chip-qc plan --graph chip.json --waypoints '[110, 109, 115]'
//! dmf-chip-qc run --graph chip.json --waypoints '[110, 109, 115]' --fail-channel 109
//! dmf-chip-qc run --graph chip.json --resume events.jsonl
//! dmf-chip-qc summarize events.jsonl
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dmf_chip_qc::config::{QcConfig, DEFAULT_CONFIG_PATH};
use dmf_chip_qc::events::{read_jsonl, JsonLinesSink};
use dmf_chip_qc::graph::{Channel, ChannelGraph};
use dmf_chip_qc::hardware::MockMover;
use dmf_chip_qc::plan::plan_test_route;
use dmf_chip_qc::{logging, RunOutcome, TransferExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dmf-chip-qc", version)]
#[command(about = "Quality-control test routine for DMF chips", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RouteArgs {
    /// Chip graph JSON file (overrides chip.graph_path)
    #[arg(long)]
    graph: Option<PathBuf>,

    /// Waypoints as a JSON array, e.g. '[110, 109, 115]'
    #[arg(long)]
    waypoints: Option<String>,

    /// Waypoint the test starts from
    #[arg(long)]
    start: Option<Channel>,

    /// Do not return to the first waypoint
    #[arg(long)]
    no_loop: bool,

    /// Channel to exclude from the chip graph (repeatable)
    #[arg(long = "bad-channel")]
    bad_channels: Vec<Channel>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the planned route as JSON
    Plan {
        #[command(flatten)]
        route: RouteArgs,
    },

    /// Run the test routine against the simulated mover
    Run {
        #[command(flatten)]
        route: RouteArgs,

        /// Channel the simulated mover cannot reach (repeatable)
        #[arg(long = "fail-channel")]
        fail_channels: Vec<Channel>,

        /// Append events to this JSON-lines file (overrides output.events_path)
        #[arg(long)]
        events: Option<PathBuf>,

        /// Continue the interrupted test in this event log; new events are
        /// appended to it unless --events is given
        #[arg(long, value_name = "EVENTS")]
        resume: Option<PathBuf>,
    },

    /// Re-derive the test result from a JSON-lines event log
    Summarize {
        /// Event log file
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = QcConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Plan { route } => plan(config, route),
        Commands::Run {
            route,
            fail_channels,
            events,
            resume,
        } => run(config, route, fail_channels, events, resume).await,
        Commands::Summarize { file } => summarize(file),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Merge command-line route options into the loaded configuration and
/// load the chip graph.
fn apply_route_args(mut config: QcConfig, args: RouteArgs) -> Result<(QcConfig, ChannelGraph)> {
    if let Some(graph) = args.graph {
        config.chip.graph_path = Some(graph);
    }
    if let Some(waypoints) = args.waypoints {
        config.route.waypoints = serde_json::from_str(&waypoints)
            .with_context(|| format!("parsing waypoints '{waypoints}'"))?;
    }
    if args.start.is_some() {
        config.route.start = args.start;
    }
    if args.no_loop {
        config.route.closed = false;
    }
    config.chip.bad_channels.extend(args.bad_channels);

    let graph = config.load_graph()?;
    info!(
        channels = graph.channel_count(),
        connections = graph.edge_count(),
        "Loaded chip graph"
    );
    Ok((config, graph))
}

fn plan(config: QcConfig, args: RouteArgs) -> Result<()> {
    let (config, graph) = apply_route_args(config, args)?;
    config.validate()?;
    let planned = plan_test_route(&graph, &config.route)?;
    println!("{}", serde_json::to_string_pretty(&planned)?);
    Ok(())
}

async fn run(
    config: QcConfig,
    args: RouteArgs,
    fail_channels: Vec<Channel>,
    events: Option<PathBuf>,
    resume: Option<PathBuf>,
) -> Result<()> {
    let (config, graph) = apply_route_args(config, args)?;
    let history = match &resume {
        // The route comes from the log; only the retry settings matter
        Some(path) => {
            config.retry_policy().validate()?;
            let history =
                read_jsonl(path).with_context(|| format!("reading {}", path.display()))?;
            info!(path = %path.display(), records = history.len(), "Resuming from event log");
            Some(history)
        }
        None => {
            config.validate()?;
            None
        }
    };

    let mover = MockMover::new().with_failing_channels(fail_channels);
    let mut executor =
        TransferExecutor::new(Arc::new(mover)).with_policy(config.retry_policy());
    if let Some(chip_uuid) = &config.chip.chip_uuid {
        executor = executor.with_chip_uuid(chip_uuid.clone());
    }
    if let Some(path) = events.or(resume).or(config.output.events_path.clone()) {
        info!(path = %path.display(), "Appending events");
        executor = executor.with_sink(JsonLinesSink::append(&path)?);
    }

    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping test");
            cancel.cancel();
        }
    });

    let outcome = match &history {
        Some(history) => executor.resume(&graph, history).await,
        None => executor.run_test(&graph, &config.route).await,
    };
    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report.result)?);
            if report.outcome != RunOutcome::Completed {
                warn!(outcome = %report.outcome, remaining = ?report.remaining_route, "Test did not complete");
            }
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.partial.result)?);
            Err(e.into())
        }
    }
}

fn summarize(file: PathBuf) -> Result<()> {
    let log = read_jsonl(&file).with_context(|| format!("reading {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&log.summarize())?);
    Ok(())
}
