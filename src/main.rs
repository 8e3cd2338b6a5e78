use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use p2p_pricer::config::AppConfig;
use p2p_pricer::engine::{ListingRegistry, RatioComputer, Scheduler};
use p2p_pricer::market_data::{OrderBookEngine, ReferencePriceCache};
use p2p_pricer::marketplace::{
    CompetitorScanner, HttpMarketplaceClient, MarketplaceApi, QuoteUpdater, RateGate, UnsignedRequests,
};
use p2p_pricer::persist::memory::MemoryListingStore;
use p2p_pricer::persist::postgres::PostgresListingStore;
use p2p_pricer::persist::ListingStore;
use p2p_pricer::telemetry;

/// Keeps P2P listings competitively priced against rival quotes and live
/// exchange reference prices.
#[derive(Debug, Parser)]
#[command(name = "p2p-pricer", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single pricing pass and exit.
    #[arg(long)]
    once: bool,

    /// Compute and log decisions without sending updates.
    #[arg(long)]
    dry_run: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Prometheus exporter port (only with the `metrics-exporter` feature).
    #[arg(long, default_value_t = 9000)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = AppConfig::load(cli.config.clone())?;
    if cli.dry_run {
        cfg.marketplace.dry_run = true;
    }
    telemetry::init_tracing(&cfg.log.filter, cli.json_logs || cfg.log.json);
    telemetry::init_metrics(cli.metrics_port).context("metrics exporter")?;
    info!(feeds = cfg.feeds.len(), dry_run = cfg.marketplace.dry_run, "Starting p2p-pricer");

    let http = reqwest::Client::builder()
        .timeout(cfg.marketplace.timeout())
        .build()
        .context("failed to build HTTP client")?;

    let store: Arc<dyn ListingStore> = match cfg.database_url.as_deref() {
        Some(url) => Arc::new(PostgresListingStore::connect(url).await.context("listing store")?),
        None => {
            warn!(listings = cfg.listings.len(), "No DATABASE_URL, using in-memory listings from config");
            Arc::new(MemoryListingStore::new(cfg.listings.clone()))
        }
    };
    let registry = Arc::new(ListingRegistry::load(store).await.context("failed to load listings")?);
    if registry.is_empty() {
        warn!("No listings loaded, passes will have nothing to price");
    }

    let references = ReferencePriceCache::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut feed_tasks = Vec::new();
    for feed in &cfg.feeds {
        let engine = OrderBookEngine::new(feed.clone(), references.clone(), http.clone(), cfg.retry.feed.to_policy());
        info!(book = engine.book_name(), ws_url = %feed.ws_url, "Spawning order book feed");
        let rx = shutdown_rx.clone();
        feed_tasks.push(tokio::spawn(async move { engine.start(rx).await }));
    }

    let m = &cfg.marketplace;
    let gate = Arc::new(RateGate::new(
        Duration::from_millis(m.search_interval_ms),
        Duration::from_millis(m.update_interval_ms),
        Duration::from_millis(m.max_interval_ms),
    ));
    let client = HttpMarketplaceClient::new(m.clone(), http.clone(), Arc::new(UnsignedRequests), gate, cfg.retry.update.to_policy());
    if !m.dry_run {
        if let Err(e) = client.sync_clock().await {
            warn!(error = %e, "Initial clock sync failed, using local time");
        }
    }
    let api: Arc<dyn MarketplaceApi> = Arc::new(client);

    let scanner = Arc::new(CompetitorScanner::new(api.clone(), cfg.retry.search.to_policy(), registry.owned_ids()));
    let computer = Arc::new(RatioComputer::new(cfg.pricing_params()?));
    let updater = Arc::new(QuoteUpdater::new(api, registry.clone()));
    let scheduler = Arc::new(
        Scheduler::new(registry.clone(), scanner, computer, updater, references.clone(), cfg.scheduler_interval(), m.rows)
            .with_reference_feeds(cfg.feed_pairs(), cfg.max_reference_age()),
    );

    let missing = scheduler.wait_for_references(cfg.first_reference_wait()).await;
    if !missing.is_empty() {
        warn!(?missing, "No reference price yet, listings on these pairs are skipped until their feed syncs");
    }

    if cli.once {
        let report = scheduler.run_pass().await;
        info!(?report, "Single pass complete");
    } else {
        let rx = shutdown_rx.clone();
        let pricing = tokio::spawn(scheduler.clone().run(rx));
        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
        if let Err(e) = pricing.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in feed_tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Feed task ended abnormally");
        }
    }
    let flushed = registry.flush().await;
    info!(?flushed, "Stopped");
    Ok(())
}
