//! Metricus
//!
//! Two process modes share this binary:
//!
//! ```text
//! ┌──────────────────────┐   GET /metrics    ┌──────────────────────┐   SSE
//! │  exporter            │◀──────────────────│  agent               │──────────▶ clients
//! │  counters + sled     │   every N seconds │  scrapers + gateway  │
//! └──────────────────────┘                   └──────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use metricus::config::{AgentFileConfig, GatewayConfig, StoreConfig, DEFAULT_SINK_CAPACITY};
use metricus::server::{self, AgentApi, ExporterApi};
use metricus::{Agent, CounterStore, ScrapeTarget, TelemetryGateway};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Metricus - metrics scrape agent with live event streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape targets and serve live event streams
    Agent(AgentArgs),
    /// Serve durable counters on /metrics
    Exporter(ExporterArgs),
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// YAML file with targets, gateway and sources
    #[arg(long, env = "METRICUS_CONFIG")]
    config: Option<PathBuf>,

    /// API server bind address
    #[arg(long, env = "AGENT_ADDR", default_value = "0.0.0.0:8888")]
    listen_addr: String,

    /// Target scraped for every metrics event subscriber
    #[arg(long, env = "GATEWAY_TARGET")]
    target: Option<String>,

    /// Scrape interval of the gateway target in seconds
    #[arg(long, env = "GATEWAY_INTERVAL_SECONDS")]
    interval_seconds: Option<u64>,

    /// Capacity of producer to subscriber channels
    #[arg(long, env = "SINK_CAPACITY")]
    sink_capacity: Option<usize>,
}

#[derive(Args, Debug)]
struct ExporterArgs {
    /// Metrics server bind address
    #[arg(long, env = "EXPORTER_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Counter database location
    #[arg(long, env = "METRICUS_DATA_PATH", default_value = "/tmp/data")]
    data_path: PathBuf,

    /// Seconds between counter flushes
    #[arg(long, env = "FLUSH_INTERVAL_SECONDS", default_value = "10")]
    flush_interval_seconds: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_json);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Command::Agent(args) => run_agent(args, shutdown).await,
        Command::Exporter(args) => run_exporter(args, shutdown).await,
    }
}

// =============================================================================
// Agent Mode
// =============================================================================

async fn run_agent(args: AgentArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let file = match &args.config {
        Some(path) => AgentFileConfig::load(path)
            .with_context(|| format!("loading agent config {}", path.display()))?,
        None => AgentFileConfig::default(),
    };

    let mut gateway_config = file.gateway.clone().unwrap_or_else(GatewayConfig::default);
    if let Some(target) = args.target {
        gateway_config.target.host = target;
    }
    if let Some(interval) = args.interval_seconds {
        gateway_config.target.interval_seconds = interval;
    }
    if let Some(capacity) = args.sink_capacity {
        gateway_config.sink_capacity = capacity;
    }

    info!("Starting metricus agent");
    info!("  API address: {}", args.listen_addr);
    info!(
        "  Gateway target: {} every {}s",
        gateway_config.target.host, gateway_config.target.interval_seconds
    );
    info!("  Background targets: {}", file.targets.len());
    info!("  Sources: {}", file.sources.len());

    let gateway = TelemetryGateway::new(gateway_config, shutdown.clone())
        .context("invalid gateway configuration")?
        .with_source_configs(&file.sources);

    let background = spawn_background_targets(&file, shutdown.clone())?;

    let api = AgentApi::new(Arc::new(gateway));
    let result = server::run_agent_server(&args.listen_addr, api, shutdown.clone()).await;
    shutdown.cancel();

    if let Some(handle) = background {
        if let Err(e) = handle.await {
            error!("Background agent failed: {}", e);
        }
    }

    result.context("agent server failed")?;
    info!("Agent shutdown complete");
    Ok(())
}

/// Scrape the file's targets continuously, logging each payload
fn spawn_background_targets(
    file: &AgentFileConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
    if file.targets.is_empty() {
        return Ok(None);
    }

    let mut targets = Vec::with_capacity(file.targets.len());
    for config in &file.targets {
        let (tx, mut rx) = mpsc::channel::<Bytes>(DEFAULT_SINK_CAPACITY);
        targets.push(ScrapeTarget::from_config(config, tx)?);

        let host = config.host.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                debug!(target_host = %host, bytes = payload.len(), "Scraped payload");
            }
        });
    }

    let retry = file.gateway.as_ref().map(|g| g.retry).unwrap_or_default();
    let agent = Agent::new(targets, retry)?;
    Ok(Some(tokio::spawn(agent.run(shutdown))))
}

// =============================================================================
// Exporter Mode
// =============================================================================

async fn run_exporter(args: ExporterArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = StoreConfig::new(args.data_path, args.flush_interval_seconds);

    info!("Starting metricus exporter");
    info!("  Metrics address: {}", args.listen_addr);
    info!("  Data path: {}", config.path.display());
    info!("  Flush interval: {}s", config.flush_interval_seconds);

    let store = CounterStore::open_with_auto_flush(&config)
        .with_context(|| format!("opening counter store at {}", config.path.display()))?;

    let api = ExporterApi::new(store.clone());
    let result = server::run_exporter_server(&args.listen_addr, api, shutdown.clone()).await;
    shutdown.cancel();

    let report = store.close().await.context("closing counter store")?;
    info!("Final flush wrote {} counter(s)", report.written);

    result.context("exporter server failed")?;
    info!("Exporter shutdown complete");
    Ok(())
}

// =============================================================================
// Process Setup
// =============================================================================

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });
}

fn init_logging(log_level: &str, log_json: bool) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "sled=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
