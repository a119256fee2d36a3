//! Swarm-bot: coordinated trading agents for binary prediction markets.
//!
//! Usage:
//!   swarm-bot [OPTIONS]
//!
//! Options:
//!   --dry-run               No orders are submitted; all else preserved
//!   --budget <USD>          Seed total capital on first run
//!   --reset                 Allow reseeding an existing ledger
//!   --agents <list>         Comma-separated subset of agents to enable
//!   --store-url <URL>       Coordination store URL (in-memory if absent)
//!   -c, --config <FILE>     Config file path (default: config/swarm.toml)
//!   -v, --verbose           Debug logging
//!
//! Exit codes: 0 normal shutdown, 2 configuration error, 3 unrecoverable
//! agent or coordination fault, 130 SIGINT.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swarm_market::{
    CatalogClient, CatalogConfig, MarketDataStream, ReplicaMap, StreamConfig, StreamEvent,
};

use swarm_bot::agent::supervisor::AgentSupervisor;
use swarm_bot::agent::{Agent, ArbitrageAgent};
use swarm_bot::budget::{BudgetManager, CoordinationFault, NonceSource, StaticNonceSource};
use swarm_bot::config::SwarmConfig;
use swarm_bot::gateway::{HttpGateway, HttpGatewayConfig, OrderGateway, PaperGateway};
use swarm_bot::risk::{CircuitBreaker, RiskController};
use swarm_bot::signal::{
    AlertScope, AlertSeverity, MarketStateUpdate, RiskAlert, Signal, SignalBus, SignalPayload,
    SignalPriority,
};
use swarm_bot::store::{CoordStore, MemoryStore, RedisStore};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "swarm-bot")]
#[command(about = "Coordinated swarm of prediction-market trading agents")]
#[command(version)]
struct Args {
    /// No orders are submitted; all other behavior preserved.
    #[arg(long)]
    dry_run: bool,

    /// Seed total capital on first run (USD).
    #[arg(long)]
    budget: Option<Decimal>,

    /// Allow --budget to reseed an existing ledger.
    #[arg(long)]
    reset: bool,

    /// Subset of agents to enable (e.g. "arb,statarb").
    #[arg(long, value_delimiter = ',')]
    agents: Option<Vec<String>>,

    /// Coordination store URL.
    #[arg(long)]
    store_url: Option<String>,

    /// Config file path.
    #[arg(short, long, default_value = "config/swarm.toml")]
    config: PathBuf,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<u8> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut config = if args.config.exists() {
        SwarmConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        SwarmConfig::default()
    };
    config.apply_env_overrides();
    config.apply_cli_overrides(
        args.dry_run,
        args.verbose,
        args.budget,
        args.reset,
        args.agents,
        args.store_url,
    );
    config.validate().context("configuration rejected")?;

    let filter = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
    info!(dry_run = config.dry_run, "swarm starting");

    // Coordination store. Loss of the store fails closed everywhere.
    let store: Arc<dyn CoordStore> = match &config.store_url {
        Some(url) => Arc::new(
            RedisStore::connect(url, Duration::from_secs(1))
                .await
                .context("coordination store unreachable")?,
        ),
        None => {
            warn!("no --store-url: using in-memory store (single process only)");
            Arc::new(MemoryStore::new())
        }
    };

    let fault = CoordinationFault::new();
    let gateway: Arc<dyn OrderGateway>;
    let nonce_source: Arc<dyn NonceSource>;
    if config.dry_run {
        gateway = Arc::new(PaperGateway::new());
        nonce_source = Arc::new(StaticNonceSource::default());
    } else {
        let http = Arc::new(
            HttpGateway::new(HttpGatewayConfig {
                base_url: config.endpoints.order_url.clone(),
                api_key: config.gateway_key.clone(),
                timeout: Duration::from_secs(3),
            })
            .context("order gateway init failed")?,
        );
        gateway = http.clone();
        nonce_source = http;
    }

    let budget = Arc::new(BudgetManager::new(
        store,
        config.budget.clone(),
        fault.clone(),
        nonce_source,
    ));
    if let Some(total) = config.budget_seed {
        budget
            .seed(total, config.reset_ledger)
            .await
            .context("ledger seeding failed")?;
    } else if !budget.is_seeded().await.context("ledger check failed")? {
        anyhow::bail!("ledger not seeded; pass --budget <USD> on first run");
    }

    let bus = SignalBus::new(config.bus.clone());
    let breaker = CircuitBreaker::new(config.breaker.clone());
    let risk = RiskController::new(config.risk.clone(), breaker, bus.clone(), budget.clone());
    risk.start();

    let supervisor = AgentSupervisor::new(
        config.supervisor.clone(),
        bus.clone(),
        budget.clone(),
        risk.clone(),
        fault.clone(),
    );
    let _janitor = budget.spawn_janitor(supervisor.shutdown_subscriber());

    // Market discovery: advisory; an empty catalog just means nothing to
    // watch until the next run.
    let catalog = CatalogClient::new(CatalogConfig {
        base_url: config.endpoints.catalog_url.clone(),
        timeout: Duration::from_secs(5),
    })
    .context("catalog client init failed")?;
    let pairs = match catalog.open_pairs(config.catalog_limit).await {
        Ok(pairs) => pairs,
        Err(e) => {
            warn!(error = %e, "market discovery failed; starting with no pairs");
            Vec::new()
        }
    };
    info!(pairs = pairs.len(), "discovered binary markets");

    let assets: Vec<String> = pairs
        .iter()
        .flat_map(|p| [p.yes_token_id.clone(), p.no_token_id.clone()])
        .collect();
    let (stream, books, events) = MarketDataStream::new(
        StreamConfig {
            url: config.endpoints.stream_url.clone(),
            ..StreamConfig::default()
        },
        assets,
    )
    .context("market data stream init failed")?;
    tokio::spawn(stream.run(supervisor.shutdown_subscriber()));
    spawn_market_state_pump(events, books.clone(), bus.clone());

    let mut agents: Vec<Arc<dyn Agent>> = Vec::new();
    if config.enabled_agents.iter().any(|a| a == &config.arb.strategy) {
        agents.push(ArbitrageAgent::new(
            config.arb.clone(),
            bus.clone(),
            budget.clone(),
            risk.clone(),
            gateway,
            books,
            pairs,
        ));
    }
    if agents.is_empty() {
        warn!("no in-process agents enabled; running as substrate only");
    }

    let outcome = supervisor.run(agents).await;
    info!(?outcome, "swarm stopped");
    Ok(outcome.exit_code())
}

/// Convert stream events into MARKET_STATE signals (LOW priority, shed
/// first under back-pressure) and protocol violations into agent alerts.
fn spawn_market_state_pump(
    mut events: tokio::sync::mpsc::Receiver<StreamEvent>,
    books: ReplicaMap,
    bus: SignalBus,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::SnapshotApplied { asset_id }
                | StreamEvent::DeltaApplied { asset_id } => {
                    let Some(book) = books.get(&asset_id) else {
                        continue;
                    };
                    let (bids, mut asks) = book.depth(3);
                    let mut depth_sample = bids;
                    depth_sample.append(&mut asks);
                    let update = MarketStateUpdate {
                        token_id: asset_id.clone(),
                        best_bid: book.best_bid(),
                        best_ask: book.best_ask(),
                        mid: book.mid(),
                        depth_sample,
                    };
                    drop(book);
                    let _ = bus.publish(Signal::new(
                        "market-data",
                        SignalPriority::Low,
                        Some(10),
                        SignalPayload::MarketState(update),
                    ));
                }
                StreamEvent::ProtocolViolation { detail } => {
                    let _ = bus.publish(Signal::new(
                        "market-data",
                        SignalPriority::High,
                        Some(600),
                        SignalPayload::RiskAlert(RiskAlert {
                            severity: AlertSeverity::High,
                            scope: AlertScope::Agent,
                            reason: format!("market feed protocol violation: {detail}"),
                        }),
                    ));
                }
                StreamEvent::Connected => info!("market data stream connected"),
                StreamEvent::Disconnected { reason } => {
                    warn!(reason = %reason, "market data stream disconnected");
                }
            }
        }
    });
}
