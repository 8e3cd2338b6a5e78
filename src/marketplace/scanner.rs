use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::engine::types::RivalQuote;
use crate::marketplace::client::MarketplaceApi;
use crate::marketplace::types::{ApiError, SearchParams};
use crate::retry::RetryPolicy;

/// Rivals could not be determined for this query. Callers skip every listing
/// that depends on it for the current pass.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("scan {query} failed after {attempts} attempt(s): {source}")]
pub struct ScanError {
    pub query: String,
    pub attempts: u32,
    #[source]
    pub source: ApiError,
}

pub struct CompetitorScanner {
    api: Arc<dyn MarketplaceApi>,
    retry: RetryPolicy,
    owned: HashSet<String>,
}

impl CompetitorScanner {
    pub fn new(api: Arc<dyn MarketplaceApi>, retry: RetryPolicy, owned: HashSet<String>) -> Self {
        Self { api, retry, owned }
    }

    /// Ranked rivals, without the operator's own listings. The marketplace
    /// order is kept as-is. `Ok(vec![])` means there are genuinely no rivals.
    #[instrument(level = "debug", skip(self), fields(query = %params))]
    pub async fn search(&self, params: &SearchParams, page: u32) -> Result<Vec<RivalQuote>, ScanError> {
        let mut attempts = 0u32;
        let result = self
            .retry
            .retry(
                "search",
                |attempt| {
                    attempts = attempt + 1;
                    self.api.search_page(params, page)
                },
                ApiError::is_transient,
            )
            .await;

        match result {
            Ok(rivals) => {
                let total = rivals.len();
                let rivals: Vec<RivalQuote> = rivals.into_iter().filter(|r| !self.owned.contains(&r.id)).collect();
                debug!(total, kept = rivals.len(), "Rivals fetched");
                metrics::counter!("p2p_scans", "outcome" => "ok").increment(1);
                Ok(rivals)
            }
            Err(source) => {
                warn!(attempts, error = %source, "Rival scan failed");
                metrics::counter!("p2p_scans", "outcome" => "failed").increment(1);
                Err(ScanError { query: params.to_string(), attempts, source })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::types::{AmountBounds, PaymentMethod, Side};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted marketplace: each search call pops the next scripted page
    /// result, updates pop from their own script (default Ok).
    #[derive(Default)]
    pub(crate) struct FakeApi {
        pub searches: Mutex<VecDeque<Result<Vec<RivalQuote>, ApiError>>>,
        pub updates: Mutex<VecDeque<Result<(), ApiError>>>,
        pub search_calls: Mutex<Vec<u32>>,
        pub update_calls: Mutex<Vec<(String, f64)>>,
    }

    impl FakeApi {
        pub fn with_searches(results: Vec<Result<Vec<RivalQuote>, ApiError>>) -> Self {
            Self { searches: Mutex::new(results.into()), ..Default::default() }
        }
    }

    #[async_trait]
    impl MarketplaceApi for FakeApi {
        async fn search_page(&self, _params: &SearchParams, page: u32) -> Result<Vec<RivalQuote>, ApiError> {
            self.search_calls.lock().push(page);
            self.searches.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn update_ratio(&self, listing_id: &str, new_ratio: f64) -> Result<(), ApiError> {
            self.update_calls.lock().push((listing_id.to_string(), new_ratio));
            self.updates.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    pub(crate) fn rival(id: &str, price: f64) -> RivalQuote {
        RivalQuote { id: id.into(), price, bounds: AmountBounds { min: 100.0, max: 50_000.0 } }
    }

    fn params() -> SearchParams {
        SearchParams {
            asset: "USDT".into(),
            fiat: "MXN".into(),
            side: Side::BUY,
            trans_amount: Some(500.0),
            payment_methods: vec![PaymentMethod::BankTransfer],
            rows: 10,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::ZERO, Duration::ZERO, Some(3))
    }

    #[tokio::test]
    async fn test_empty_response_is_one_call() {
        let api = Arc::new(FakeApi::with_searches(vec![Ok(vec![])]));
        let scanner = CompetitorScanner::new(api.clone(), policy(), HashSet::new());
        assert_eq!(scanner.search(&params(), 1).await, Ok(vec![]));
        assert_eq!(api.search_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_exhaust_attempts() {
        let api = Arc::new(FakeApi::with_searches(vec![
            Err(ApiError::Timeout),
            Err(ApiError::Status(502)),
            Err(ApiError::Transport("reset".into())),
            Ok(vec![rival("late", 1.0)]),
        ]));
        let scanner = CompetitorScanner::new(api.clone(), policy(), HashSet::new());
        let err = scanner.search(&params(), 1).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.source, ApiError::Transport("reset".into()));
        assert_eq!(api.search_calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let api = Arc::new(FakeApi::with_searches(vec![Err(ApiError::Rejected { code: "-1".into(), msg: "bad".into() })]));
        let scanner = CompetitorScanner::new(api.clone(), policy(), HashSet::new());
        assert_eq!(scanner.search(&params(), 1).await.unwrap_err().attempts, 1);
    }

    #[tokio::test]
    async fn test_own_listings_removed_and_order_kept() {
        let api = Arc::new(FakeApi::with_searches(vec![Ok(vec![
            rival("r2", 19.2),
            rival("mine", 19.0),
            rival("r1", 19.1),
        ])]));
        let owned = HashSet::from(["mine".to_string()]);
        let scanner = CompetitorScanner::new(api, policy(), owned);
        let ids: Vec<String> = scanner.search(&params(), 1).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }
}
