//! CLI command definitions for runforge.
//!
//! - `config` prints the effective orchestrator configuration and the source catalog
//! - `simulate` drives a research run over simulated sources and prints every
//!   broadcast as a JSON line

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::broadcast::{BroadcastHub, RunEvent};
use crate::pipeline::{Orchestrator, OrchestratorConfig, ResearchInput, ResearchPipeline, RunOutcome};
use crate::sources::{SimulatedSource, SourceRegistry, SourceSettings, SOURCE_CATALOG};
use crate::usage::UsageMonitor;

/// Default number of ideas each simulated source returns.
const DEFAULT_ITEMS_PER_SOURCE: usize = 3;

/// Default simulated fetch latency in milliseconds.
const DEFAULT_LATENCY_MS: u64 = 50;

/// Research run orchestrator with live progress broadcasting.
#[derive(Parser)]
#[command(name = "runforge")]
#[command(about = "Run research pipelines on worker threads with live progress broadcasts")]
#[command(version)]
#[command(
    long_about = "runforge starts research runs on worker threads, bridges their progress to broadcast channels and tracks metered usage.\n\nExample usage:\n  runforge simulate \"pet care\" --sources reddit,github --cancel-after-ms 200"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print the effective configuration and the known sources.
    Config(ConfigArgs),

    /// Drive a research run over simulated sources.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
}

/// Arguments for `runforge config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Print as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `runforge simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Research query.
    pub query: String,

    /// Comma-separated source ids (default: every source enabled by default).
    #[arg(short, long)]
    pub sources: Option<String>,

    /// Run id (default: generated).
    #[arg(long)]
    pub run_id: Option<String>,

    /// Ideas returned by each source.
    #[arg(short = 'n', long, default_value_t = DEFAULT_ITEMS_PER_SOURCE)]
    pub items: usize,

    /// Simulated latency of each fetch in milliseconds.
    #[arg(long, default_value_t = DEFAULT_LATENCY_MS)]
    pub latency_ms: u64,

    /// Comma-separated source ids whose fetch fails.
    #[arg(long)]
    pub fail: Option<String>,

    /// Request cancellation this many milliseconds after the start.
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,

    /// Metering provider (default: RUNFORGE_DEFAULT_PROVIDER).
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Print the ranked ideas when the run completes.
    #[arg(long)]
    pub print_results: bool,

    /// Print Prometheus metrics when the run ends.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Config(args) => run_config_command(args)?,
        Commands::Simulate(args) => run_simulate_command(args).await?,
    }
    Ok(())
}

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;
    let defaults = SourceSettings::new();

    if args.json {
        let sources: Vec<_> = SOURCE_CATALOG
            .iter()
            .map(|source| {
                json!({
                    "id": source.id,
                    "name": source.name,
                    "category": source.category,
                    "enabled": defaults.is_enabled(source.id),
                })
            })
            .collect();
        let report = json!({
            "channel": config.channel,
            "bridge_timeout_ms": config.bridge_timeout.as_millis() as u64,
            "default_provider": config.default_provider,
            "default_rate_limit": config.default_rate_limit,
            "usage_log_interval_secs": config.usage_log_interval.as_secs(),
            "emit_final_usage": config.emit_final_usage,
            "sources": sources,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("channel:            {}", config.channel);
    println!("bridge timeout:     {} ms", config.bridge_timeout.as_millis());
    println!("default provider:   {}", config.default_provider);
    match config.default_rate_limit {
        Some(limit) => println!("default rate limit: {} units/min", limit),
        None => println!("default rate limit: none"),
    }
    println!("usage log interval: {} s", config.usage_log_interval.as_secs());
    println!("final usage event:  {}", config.emit_final_usage);
    println!();
    println!("sources:");
    for source in SOURCE_CATALOG {
        let state = if defaults.is_enabled(source.id) { "on" } else { "off" };
        println!("  {:<14} {:<18} {}", source.id, source.name, state);
    }

    Ok(())
}

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;
    if args.metrics {
        crate::metrics::init_metrics()?;
    }

    let selected: Vec<String> = match args.sources.as_deref() {
        Some(list) => split_list(list),
        None => SOURCE_CATALOG
            .iter()
            .filter(|source| source.enabled_default)
            .map(|source| source.id.to_string())
            .collect(),
    };
    let failing: HashSet<String> = args.fail.as_deref().map(split_list).unwrap_or_default().into_iter().collect();

    // Explicitly requested sources run even if they are off by default.
    let mut settings = SourceSettings::new();
    let mut sources = SourceRegistry::new();
    for id in &selected {
        settings.set(id.clone(), true);
        let mut source = SimulatedSource::new(id.clone())
            .with_items(args.items)
            .with_latency(Duration::from_millis(args.latency_ms));
        if failing.contains(id) {
            source = source.failing("simulated outage");
        }
        sources.register(Arc::new(source));
    }

    let hub = Arc::new(BroadcastHub::new());
    let mut events = hub.subscribe(&config.channel);
    let orchestrator = Orchestrator::new(ResearchPipeline::new(sources), hub, config.clone());
    let monitor = UsageMonitor::start(orchestrator.registry().clone(), config.usage_log_interval);

    let run_id = args
        .run_id
        .unwrap_or_else(Orchestrator::<ResearchPipeline>::generate_run_id);
    let mut input = ResearchInput::new(args.query, selected).with_settings(settings);
    if let Some(provider) = args.provider {
        input = input.with_provider(provider);
    }

    info!(run_id = %run_id, "Starting simulated run");
    let task = orchestrator.spawn_run(run_id.clone(), input)?;

    if let Some(delay) = args.cancel_after_ms {
        let orchestrator = orchestrator.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if !orchestrator.cancellation_request(&run_id) {
                info!(run_id = %run_id, "Run finished before the cancel request");
            }
        });
    }

    loop {
        match events.recv().await {
            Ok(payload) => {
                println!("{}", serde_json::to_string(&payload)?);
                let terminal = serde_json::from_value::<RunEvent>(payload)
                    .map(|event| event.run_id() == run_id && event.is_terminal())
                    .unwrap_or(false);
                if terminal {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    let outcome = task.await?;
    monitor.stop().await;

    let outcome = outcome?;
    match &outcome {
        RunOutcome::Completed(results) => {
            info!(run_id = %run_id, ideas = results.len(), "Simulated run completed");
            if args.print_results {
                println!("{}", serde_json::to_string_pretty(results)?);
            }
        }
        RunOutcome::Cancelled => info!(run_id = %run_id, "Simulated run cancelled"),
    }

    if args.metrics {
        print!("{}", crate::metrics::export_metrics());
    }

    Ok(())
}

/// Split a comma-separated list, dropping blanks.
fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_simulate_command_defaults() {
        let cli = Cli::try_parse_from(["runforge", "simulate", "pet care"]).expect("should parse");

        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.query, "pet care");
                assert!(args.sources.is_none());
                assert!(args.run_id.is_none());
                assert_eq!(args.items, DEFAULT_ITEMS_PER_SOURCE);
                assert_eq!(args.latency_ms, DEFAULT_LATENCY_MS);
                assert!(args.cancel_after_ms.is_none());
                assert!(!args.print_results);
                assert!(!args.metrics);
            }
            _ => panic!("Expected Simulate command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_simulate_command_with_all_options() {
        let args = vec![
            "runforge",
            "sim",
            "ai tools",
            "-s",
            "reddit,github",
            "--run-id",
            "abc12345",
            "-n",
            "5",
            "--latency-ms",
            "0",
            "--fail",
            "github",
            "--cancel-after-ms",
            "150",
            "-p",
            "gemini",
            "--print-results",
            "--metrics",
            "-l",
            "debug",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");
        assert_eq!(cli.log_level, "debug");

        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.sources.as_deref(), Some("reddit,github"));
                assert_eq!(args.run_id.as_deref(), Some("abc12345"));
                assert_eq!(args.items, 5);
                assert_eq!(args.latency_ms, 0);
                assert_eq!(args.fail.as_deref(), Some("github"));
                assert_eq!(args.cancel_after_ms, Some(150));
                assert_eq!(args.provider.as_deref(), Some("gemini"));
                assert!(args.print_results);
                assert!(args.metrics);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_config_command() {
        let cli = Cli::try_parse_from(["runforge", "config", "--json"]).expect("should parse");
        match cli.command {
            Commands::Config(args) => assert!(args.json),
            _ => panic!("Expected Config command"),
        }
    }

    #[test]
    fn test_simulate_requires_query() {
        assert!(Cli::try_parse_from(["runforge", "simulate"]).is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" reddit, ,github ,"), vec!["reddit", "github"]);
        assert!(split_list("").is_empty());
    }
}
