use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::engine::ratio::PricingParams;
use crate::engine::thresholds::{ThresholdRule, ThresholdTable};
use crate::engine::types::Listing;
use crate::market_data::pair_key;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub filter: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarketplaceConfig {
    pub base_url: String,
    pub search_path: String,
    pub update_path: String,
    pub time_path: String,
    pub timeout_ms: u64,
    pub search_interval_ms: u64,
    pub update_interval_ms: u64,
    /// Upper bound for the rate gate after repeated throttling.
    pub max_interval_ms: u64,
    pub rows: u32,
    pub dry_run: bool,
}

impl MarketplaceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub adjustment_step: f64,
    pub hysteresis: f64,
    pub epsilon: f64,
    pub threshold_min_change: f64,
    pub buy_threshold_ceiling: f64,
    pub sell_threshold_floor: f64,
    pub default_buy_threshold: f64,
    pub default_sell_threshold: f64,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Reference prices older than this are treated as absent.
    pub max_reference_age_secs: u64,
    /// How long startup waits for every feed to publish before the first pass.
    pub first_reference_wait_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Omit for unlimited attempts.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub jitter: f64,
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.base_ms), Duration::from_millis(self.cap_ms), self.max_attempts)
            .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub feed: RetryConfig,
    pub search: RetryConfig,
    pub update: RetryConfig,
}

/// One diff-orders market-data feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedConfig {
    pub book: String,
    pub asset: String,
    pub fiat: String,
    pub ws_url: String,
    pub rest_url: String,
    /// Fiat notional the reference prices are weighted over.
    pub target_notional: f64,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_size_decimals")]
    pub size_decimals: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_buffered_diffs")]
    pub max_buffered_diffs: usize,
}

fn default_price_decimals() -> u32 {
    2
}
fn default_size_decimals() -> u32 {
    8
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_max_buffered_diffs() -> usize {
    4096
}

impl FeedConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub log: LogConfig,
    pub marketplace: MarketplaceConfig,
    pub pricing: PricingConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetrySettings,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    /// Seed listings for the in-memory store.
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Layered load: compiled defaults, then the TOML file at `config_path`
    /// (if any), then `P2P_`-prefixed environment variables with `__` as the
    /// nesting separator (e.g. `P2P_PRICING__MAX_RATIO=115`). A plain
    /// `DATABASE_URL` fills `database_url` when nothing else did.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("log.filter", "info,p2p_pricer=debug")?
            .set_default("log.json", false)?
            .set_default("marketplace.base_url", "https://p2p.example.com")?
            .set_default("marketplace.search_path", "/bapi/c2c/v2/friendly/c2c/adv/search")?
            .set_default("marketplace.update_path", "/sapi/v1/c2c/ads/update")?
            .set_default("marketplace.time_path", "/api/v3/time")?
            .set_default("marketplace.timeout_ms", 5000i64)?
            .set_default("marketplace.search_interval_ms", 250i64)?
            .set_default("marketplace.update_interval_ms", 500i64)?
            .set_default("marketplace.max_interval_ms", 10_000i64)?
            .set_default("marketplace.rows", 20i64)?
            .set_default("marketplace.dry_run", false)?
            .set_default("pricing.min_ratio", 90.0)?
            .set_default("pricing.max_ratio", 110.0)?
            .set_default("pricing.adjustment_step", 0.05)?
            .set_default("pricing.hysteresis", 0.5)?
            .set_default("pricing.epsilon", 0.005)?
            .set_default("pricing.threshold_min_change", 0.005)?
            .set_default("pricing.buy_threshold_ceiling", 1.0)?
            .set_default("pricing.sell_threshold_floor", 1.0)?
            .set_default("pricing.default_buy_threshold", 0.98)?
            .set_default("pricing.default_sell_threshold", 1.02)?
            .set_default("scheduler.interval_secs", 30i64)?
            .set_default("scheduler.max_reference_age_secs", 120i64)?
            .set_default("scheduler.first_reference_wait_secs", 15i64)?
            .set_default("retry.feed.base_ms", 500i64)?
            .set_default("retry.feed.cap_ms", 30_000i64)?
            .set_default("retry.feed.jitter", 0.2)?
            .set_default("retry.search.base_ms", 200i64)?
            .set_default("retry.search.cap_ms", 2_000i64)?
            .set_default("retry.search.max_attempts", 3i64)?
            .set_default("retry.search.jitter", 0.1)?
            .set_default("retry.update.base_ms", 300i64)?
            .set_default("retry.update.cap_ms", 3_000i64)?
            .set_default("retry.update.max_attempts", 4i64)?
            .set_default("retry.update.jitter", 0.1)?;

        if let Some(path) = config_path {
            let path_str = path.to_str().context("config path is not valid UTF-8")?;
            builder = builder.add_source(File::with_name(path_str).required(true));
        }

        // prefix separator must be explicit, otherwise it follows `separator`
        builder = builder.add_source(
            Environment::with_prefix("P2P")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        if cfg.database_url.is_none() {
            cfg.database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pricing;
        if !(p.min_ratio > 0.0 && p.min_ratio <= p.max_ratio) {
            bail!("pricing.min_ratio must be positive and not above max_ratio");
        }
        if p.adjustment_step < 0.0 || p.hysteresis < 0.0 || p.epsilon < 0.0 {
            bail!("pricing step, hysteresis and epsilon must not be negative");
        }
        if self.marketplace.rows == 0 {
            bail!("marketplace.rows must be at least 1");
        }
        if self.scheduler.max_reference_age_secs == 0 {
            bail!("scheduler.max_reference_age_secs must be at least 1");
        }
        for feed in &self.feeds {
            if feed.target_notional <= 0.0 {
                bail!("feed {} needs a positive target_notional", feed.book);
            }
        }
        for listing in &self.listings {
            if listing.base_price().is_none() {
                bail!("listing {} has a non-positive price or ratio", listing.id);
            }
        }
        self.threshold_table()?;
        Ok(())
    }

    fn threshold_table(&self) -> Result<ThresholdTable> {
        let p = &self.pricing;
        ThresholdTable::from_rules(p.default_buy_threshold, p.default_sell_threshold, &p.thresholds)
            .context("invalid pricing.thresholds")
    }

    pub fn pricing_params(&self) -> Result<PricingParams> {
        let p = &self.pricing;
        Ok(PricingParams {
            min_ratio: p.min_ratio,
            max_ratio: p.max_ratio,
            adjustment_step: p.adjustment_step,
            hysteresis: p.hysteresis,
            epsilon: p.epsilon,
            threshold_min_change: p.threshold_min_change,
            buy_threshold_ceiling: p.buy_threshold_ceiling,
            sell_threshold_floor: p.sell_threshold_floor,
            thresholds: self.threshold_table()?,
        })
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs)
    }

    pub fn max_reference_age(&self) -> Duration {
        Duration::from_secs(self.scheduler.max_reference_age_secs)
    }

    pub fn first_reference_wait(&self) -> Duration {
        Duration::from_secs(self.scheduler.first_reference_wait_secs)
    }

    /// Pair keys that have a live feed behind them.
    pub fn feed_pairs(&self) -> HashSet<String> {
        self.feeds.iter().map(|f| pair_key(&f.asset, &f.fiat)).collect()
    }
}
