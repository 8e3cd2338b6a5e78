//! Pricing loop. Each pass groups active listings by their rival query,
//! scans and computes every group concurrently, pushes the resulting
//! updates, flushes the registry and sleeps.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::ratio::RatioComputer;
use crate::engine::registry::ListingRegistry;
use crate::engine::types::{Decision, Listing, RivalQuote};
use crate::market_data::{pair_key, ReferencePriceCache, ReferencePrices};
use crate::marketplace::types::SearchParams;
use crate::marketplace::{CompetitorScanner, QuoteUpdater, UpdateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Idle,
    Scanning,
    Computing,
    Updating,
    Sleeping,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub groups: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Listings left alone because rivals could not be determined or none
    /// were usable.
    pub skipped: usize,
    pub failed: usize,
    pub delisted: usize,
    pub panicked_groups: usize,
}

const DEFAULT_MAX_REFERENCE_AGE: Duration = Duration::from_secs(120);
const REFERENCE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
enum ReferenceGap {
    #[error("no reference price published yet")]
    Missing,
    #[error("reference price is {age_ms} ms old")]
    Stale { age_ms: i64 },
}

#[derive(Clone)]
struct GroupContext {
    scanner: Arc<CompetitorScanner>,
    computer: Arc<RatioComputer>,
    references: ReferencePriceCache,
    /// Pairs with a live feed; their listings are never priced without a book.
    feed_pairs: Arc<HashSet<String>>,
    max_reference_age: Duration,
    rows: u32,
}

#[derive(Debug, Default)]
struct GroupResult {
    decisions: Vec<(Listing, Decision)>,
    skipped: usize,
    failed: usize,
}

impl GroupContext {
    fn reference_for(&self, listing: &Listing) -> Result<Option<ReferencePrices>, ReferenceGap> {
        match self.references.get(&listing.asset, &listing.fiat) {
            None if self.feed_pairs.contains(&pair_key(&listing.asset, &listing.fiat)) => Err(ReferenceGap::Missing),
            None => Ok(None),
            Some(prices) => {
                let age_ms = prices.age_ms(crate::now_ms());
                if age_ms > self.max_reference_age.as_millis() as i64 {
                    Err(ReferenceGap::Stale { age_ms })
                } else {
                    Ok(Some(prices))
                }
            }
        }
    }

    fn decide(
        &self,
        listing: &Listing,
        reference: Option<&ReferencePrices>,
        rivals: &[RivalQuote],
        out: &mut GroupResult,
    ) -> Option<Decision> {
        match self.computer.compute(listing, rivals, reference) {
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!(id = %listing.id, error = %e, "Listing skipped");
                out.failed += 1;
                None
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(group = %key, listings = members.len()))]
    async fn price_group(self, key: String, members: Vec<Listing>) -> GroupResult {
        let mut out = GroupResult::default();
        let mut priced = Vec::with_capacity(members.len());
        for listing in members {
            match self.reference_for(&listing) {
                Ok(reference) => priced.push((listing, reference)),
                Err(gap) => {
                    warn!(
                        id = %listing.id,
                        pair = %pair_key(&listing.asset, &listing.fiat),
                        reason = %gap,
                        "Listing skipped, no usable reference price"
                    );
                    metrics::counter!("p2p_reference_unavailable").increment(1);
                    out.skipped += 1;
                }
            }
        }
        let Some((first, _)) = priced.first() else {
            return out;
        };
        let params = SearchParams::for_listing(first, self.rows);

        let mut rivals = match self.scanner.search(&params, 1).await {
            Ok(rivals) => rivals,
            Err(e) => {
                warn!(error = %e, "Group skipped for this pass");
                out.skipped += priced.len();
                return out;
            }
        };

        let mut starved = Vec::new();
        for (listing, reference) in priced {
            match self.decide(&listing, reference.as_ref(), &rivals, &mut out) {
                Some(Decision::InsufficientData) => starved.push((listing, reference)),
                Some(decision) => out.decisions.push((listing, decision)),
                None => {}
            }
        }
        if starved.is_empty() {
            return out;
        }

        // One widened re-fetch per group
        match self.scanner.search(&params, 2).await {
            Ok(more) => rivals.extend(more),
            Err(e) => debug!(error = %e, "Widened scan failed"),
        }
        for (listing, reference) in starved {
            match self.decide(&listing, reference.as_ref(), &rivals, &mut out) {
                Some(Decision::InsufficientData) => {
                    debug!(id = %listing.id, "No usable rival after widened scan");
                    out.skipped += 1;
                }
                Some(decision) => out.decisions.push((listing, decision)),
                None => {}
            }
        }
        out
    }
}

pub struct Scheduler {
    registry: Arc<ListingRegistry>,
    updater: Arc<QuoteUpdater>,
    group: GroupContext,
    interval: Duration,
    state: Mutex<PassState>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ListingRegistry>,
        scanner: Arc<CompetitorScanner>,
        computer: Arc<RatioComputer>,
        updater: Arc<QuoteUpdater>,
        references: ReferencePriceCache,
        interval: Duration,
        rows: u32,
    ) -> Self {
        Self {
            registry,
            updater,
            group: GroupContext {
                scanner,
                computer,
                references,
                feed_pairs: Arc::new(HashSet::new()),
                max_reference_age: DEFAULT_MAX_REFERENCE_AGE,
                rows,
            },
            interval,
            state: Mutex::new(PassState::Idle),
        }
    }

    /// Listings on `feed_pairs` are skipped while their reference price is
    /// missing or older than `max_age`.
    pub fn with_reference_feeds(mut self, feed_pairs: HashSet<String>, max_age: Duration) -> Self {
        self.group.feed_pairs = Arc::new(feed_pairs);
        self.group.max_reference_age = max_age;
        self
    }

    /// Wait up to `limit` for every feed-backed pair to publish once.
    /// Returns the pairs still without a price, sorted.
    pub async fn wait_for_references(&self, limit: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let mut missing: Vec<String> = self
                .group
                .feed_pairs
                .iter()
                .filter(|key| self.group.references.get_pair(key).is_none())
                .cloned()
                .collect();
            if missing.is_empty() || tokio::time::Instant::now() >= deadline {
                missing.sort();
                return missing;
            }
            tokio::time::sleep(REFERENCE_POLL).await;
        }
    }

    pub fn state(&self) -> PassState {
        *self.state.lock()
    }

    fn enter(&self, state: PassState) {
        *self.state.lock() = state;
    }

    /// Loop until `shutdown` flips to true, then flush once more.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_pass().await;
            info!(?report, "Pricing pass complete");

            self.enter(PassState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
            self.enter(PassState::Idle);
        }
        let flushed = self.registry.flush().await;
        info!(?flushed, "Scheduler stopped");
    }

    pub async fn run_pass(&self) -> PassReport {
        let started = Instant::now();
        let mut report = PassReport::default();

        let moved = self.group.references.flush();
        for (pair, prices) in &moved {
            debug!(%pair, bid = prices.bid, ask = prices.ask, sequence = prices.sequence, "Reference price moved");
        }

        self.enter(PassState::Scanning);
        let groups = self.registry.active().into_iter().into_group_map_by(|l| l.group_key.clone());
        report.groups = groups.len();

        let mut tasks = JoinSet::new();
        for (key, members) in groups {
            tasks.spawn(self.group.clone().price_group(key, members));
        }

        self.enter(PassState::Computing);
        let mut decisions = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    report.skipped += result.skipped;
                    report.failed += result.failed;
                    decisions.extend(result.decisions);
                }
                Err(e) => {
                    error!(error = %e, "Group task aborted");
                    report.panicked_groups += 1;
                }
            }
        }

        self.enter(PassState::Updating);
        let mut updates = Vec::new();
        for (listing, decision) in decisions.into_iter().unique_by(|(l, _)| l.id.clone()) {
            if decision.is_update() {
                updates.push((listing, decision));
            } else {
                report.unchanged += 1;
            }
        }
        let outcomes = join_all(updates.iter().map(|(listing, decision)| self.updater.apply(listing, decision))).await;
        for outcome in outcomes {
            match outcome {
                UpdateOutcome::Updated { .. } => report.updated += 1,
                UpdateOutcome::Delisted => report.delisted += 1,
                UpdateOutcome::Skipped => report.unchanged += 1,
                UpdateOutcome::Rejected(_) | UpdateOutcome::Failed(_) => report.failed += 1,
            }
        }

        self.registry.flush().await;

        metrics::counter!("p2p_pass_updates").increment(report.updated as u64);
        metrics::counter!("p2p_pass_failures").increment(report.failed as u64);
        metrics::gauge!("p2p_pass_duration_seconds").set(started.elapsed().as_secs_f64());
        metrics::gauge!("p2p_active_listings").set(self.registry.active().len() as f64);
        metrics::gauge!("p2p_registry_listings").set(self.registry.len() as f64);
        self.enter(PassState::Idle);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ratio::PricingParams;
    use crate::engine::thresholds::ThresholdTable;
    use crate::engine::types::{AmountBounds, PaymentMethod, Side};
    use crate::marketplace::scanner::tests::{rival, FakeApi};
    use crate::marketplace::types::ApiError;
    use crate::persist::memory::MemoryListingStore;
    use crate::retry::RetryPolicy;

    fn listing(id: &str, price: f64, ratio: f64, methods: Vec<PaymentMethod>) -> Listing {
        Listing {
            id: id.into(),
            side: Side::BUY,
            asset: "USDT".into(),
            fiat: "MXN".into(),
            price,
            ratio,
            target_rank: 1,
            bounds: AmountBounds { min: 500.0, max: 10_000.0 },
            payment_methods: methods,
            group_key: String::new(),
            active: true,
            updated_at_ms: 0,
        }
    }

    fn computer() -> Arc<RatioComputer> {
        Arc::new(RatioComputer::new(PricingParams {
            min_ratio: 80.0,
            max_ratio: 120.0,
            adjustment_step: 0.05,
            hysteresis: 0.5,
            epsilon: 0.005,
            threshold_min_change: 0.005,
            buy_threshold_ceiling: 1.0,
            sell_threshold_floor: 1.0,
            thresholds: ThresholdTable::from_rules(0.9, 1.1, &[]).unwrap(),
        }))
    }

    async fn scheduler(api: Arc<FakeApi>, listings: Vec<Listing>) -> (Scheduler, Arc<MemoryListingStore>) {
        scheduler_with(api, listings, ReferencePriceCache::new()).await
    }

    async fn scheduler_with(
        api: Arc<FakeApi>,
        listings: Vec<Listing>,
        references: ReferencePriceCache,
    ) -> (Scheduler, Arc<MemoryListingStore>) {
        let store = Arc::new(MemoryListingStore::new(listings));
        let registry = Arc::new(ListingRegistry::load(store.clone()).await.unwrap());
        let retry = RetryPolicy::new(Duration::ZERO, Duration::ZERO, Some(2));
        let scanner = Arc::new(CompetitorScanner::new(api.clone(), retry, registry.owned_ids()));
        let updater = Arc::new(QuoteUpdater::new(api, registry.clone()));
        let s = Scheduler::new(registry, scanner, computer(), updater, references, Duration::from_millis(5), 20);
        (s, store)
    }

    fn page(rivals: Vec<RivalQuote>) -> Result<Vec<RivalQuote>, ApiError> {
        Ok(rivals)
    }

    #[tokio::test]
    async fn test_one_bad_listing_does_not_stop_siblings() {
        let api = Arc::new(FakeApi::with_searches(vec![page(vec![rival("r1", 19.5)])]));
        let (scheduler, store) = scheduler(
            api.clone(),
            vec![
                listing("good", 18.0, 90.0, vec![PaymentMethod::BankTransfer]),
                listing("bad", 0.0, 90.0, vec![PaymentMethod::BankTransfer]),
            ],
        )
        .await;

        let report = scheduler.run_pass().await;
        assert_eq!(report.groups, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 1);
        // one scan for the shared group
        assert_eq!(api.search_calls.lock().as_slice(), &[1]);
        assert_eq!(store.row("good").unwrap().ratio, 97.45);
        assert_eq!(store.row("bad").unwrap().ratio, 90.0);
        assert_eq!(scheduler.state(), PassState::Idle);
    }

    #[tokio::test]
    async fn test_insufficient_data_widens_once() {
        let api = Arc::new(FakeApi::with_searches(vec![
            // all under the 18.0 floor
            page(vec![rival("cheap", 17.0)]),
            page(vec![rival("r2", 19.0)]),
        ]));
        let (scheduler, store) = scheduler(api.clone(), vec![listing("a", 18.0, 90.0, vec![PaymentMethod::Card])]).await;
        let report = scheduler.run_pass().await;
        assert_eq!(api.search_calls.lock().as_slice(), &[1, 2]);
        assert_eq!(report.updated, 1);
        assert_eq!(store.row("a").unwrap().ratio, 94.95);
    }

    #[tokio::test]
    async fn test_still_starved_is_skipped() {
        let api = Arc::new(FakeApi::with_searches(vec![page(vec![]), page(vec![])]));
        let (scheduler, _) = scheduler(api.clone(), vec![listing("a", 18.0, 90.0, vec![PaymentMethod::Card])]).await;
        let report = scheduler.run_pass().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated, 0);
        assert!(api.update_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_skips_group() {
        let api = Arc::new(FakeApi::with_searches(vec![
            Err(ApiError::Rejected { code: "-1".into(), msg: "bad query".into() }),
        ]));
        let (scheduler, _) = scheduler(
            api.clone(),
            vec![listing("a", 18.0, 90.0, vec![PaymentMethod::Card]), listing("b", 18.0, 91.0, vec![PaymentMethod::Card])],
        )
        .await;
        let report = scheduler.run_pass().await;
        assert_eq!(report.skipped, 2);
        assert!(api.update_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_delisted_listing_leaves_registry() {
        let api = Arc::new(FakeApi::with_searches(vec![page(vec![rival("r1", 19.5)])]));
        api.updates.lock().push_back(Err(ApiError::NotFound));
        let (scheduler, store) = scheduler(api, vec![listing("gone", 18.0, 90.0, vec![PaymentMethod::Card])]).await;
        let report = scheduler.run_pass().await;
        assert_eq!(report.delisted, 1);
        assert!(!store.row("gone").unwrap().active);
        assert_eq!(scheduler.run_pass().await.groups, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let api = Arc::new(FakeApi::default());
        let (scheduler, _) = scheduler(api, vec![]).await;
        let scheduler = Arc::new(scheduler);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(scheduler.state(), PassState::Idle);
    }

    fn fed(pairs: &[&str]) -> HashSet<String> {
        pairs.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fed_pair_without_reference_is_skipped() {
        let api = Arc::new(FakeApi::with_searches(vec![page(vec![rival("r1", 19.5)])]));
        let unfed = Listing { fiat: "ARS".into(), ..listing("b", 18.0, 90.0, vec![PaymentMethod::Card]) };
        let (scheduler, store) =
            scheduler_with(api.clone(), vec![listing("a", 18.0, 90.0, vec![PaymentMethod::Card]), unfed], ReferencePriceCache::new())
                .await;
        let scheduler = scheduler.with_reference_feeds(fed(&["USDT/MXN"]), Duration::from_secs(60));

        let report = scheduler.run_pass().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated, 1);
        // only the pair without a feed was scanned
        assert_eq!(api.search_calls.lock().as_slice(), &[1]);
        assert_eq!(store.row("a").unwrap().ratio, 90.0);
        assert_eq!(store.row("b").unwrap().ratio, 97.45);
    }

    #[tokio::test]
    async fn test_stale_reference_is_treated_as_absent() {
        let api = Arc::new(FakeApi::with_searches(vec![page(vec![rival("r1", 19.5)])]));
        let references = ReferencePriceCache::new();
        let (scheduler, store) =
            scheduler_with(api.clone(), vec![listing("a", 18.0, 90.0, vec![PaymentMethod::Card])], references.clone()).await;
        let scheduler = scheduler.with_reference_feeds(fed(&["USDT/MXN"]), Duration::from_secs(60));

        let old = ReferencePrices { bid: 17.9, ask: 18.0, sequence: 1, updated_at_ms: crate::now_ms() - 600_000 };
        references.set("USDT", "MXN", old);
        let report = scheduler.run_pass().await;
        assert_eq!(report.skipped, 1);
        assert!(api.search_calls.lock().is_empty());
        assert_eq!(store.row("a").unwrap().ratio, 90.0);

        // the same book republished is usable again
        references.set("USDT", "MXN", ReferencePrices { sequence: 2, updated_at_ms: crate::now_ms(), ..old });
        let report = scheduler.run_pass().await;
        assert_eq!(report.skipped, 0);
        assert_eq!(report.updated, 1);
        assert_eq!(store.row("a").unwrap().ratio, 97.45);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_references_is_bounded() {
        let references = ReferencePriceCache::new();
        let (scheduler, _) = scheduler_with(Arc::new(FakeApi::default()), vec![], references.clone()).await;
        let scheduler = scheduler.with_reference_feeds(fed(&["USDT/MXN", "BTC/MXN"]), Duration::from_secs(60));

        let writer = references.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.set("USDT", "MXN", ReferencePrices { bid: 17.9, ask: 18.0, sequence: 1, updated_at_ms: 1 });
        });
        let started = tokio::time::Instant::now();
        assert_eq!(scheduler.wait_for_references(Duration::from_secs(2)).await, vec!["BTC/MXN".to_string()]);
        assert!(started.elapsed() >= Duration::from_secs(2));

        references.set("BTC", "MXN", ReferencePrices { bid: 1.0, ask: 1.1, sequence: 1, updated_at_ms: 1 });
        assert!(scheduler.wait_for_references(Duration::from_secs(2)).await.is_empty());
    }
}
