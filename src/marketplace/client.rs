// HTTP client for the P2P marketplace: rival search and listing updates.
//
// Every call waits on the shared RateGate first. Throttling responses widen
// the gate for that endpoint class; clock-skew responses resynchronise the
// local offset before the retry.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info, instrument, warn};

use crate::config::MarketplaceConfig;
use crate::engine::types::RivalQuote;
use crate::marketplace::rate_gate::{EndpointClass, RateGate};
use crate::marketplace::types::{ApiError, SearchParams, SearchResponse, TimeResponse, UpdateRequest, UpdateResponse};
use crate::retry::RetryPolicy;

#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// One page of rivals in marketplace rank order. Single attempt.
    async fn search_page(&self, params: &SearchParams, page: u32) -> Result<Vec<RivalQuote>, ApiError>;

    /// Push a new floating ratio for one listing, retrying transient failures.
    async fn update_ratio(&self, listing_id: &str, new_ratio: f64) -> Result<(), ApiError>;
}

/// Produces the authentication parameters for a signed call.
pub trait RequestSigner: Send + Sync {
    /// Extra query pairs for the given query string.
    fn sign(&self, query: &str) -> Vec<(String, String)>;

    fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Signer for deployments where authentication happens upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsignedRequests;

impl RequestSigner for UnsignedRequests {
    fn sign(&self, _query: &str) -> Vec<(String, String)> {
        Vec::new()
    }
}

pub struct HttpMarketplaceClient {
    settings: MarketplaceConfig,
    http: reqwest::Client,
    signer: Arc<dyn RequestSigner>,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    clock_offset_ms: AtomicI64,
}

impl HttpMarketplaceClient {
    pub fn new(
        settings: MarketplaceConfig,
        http: reqwest::Client,
        signer: Arc<dyn RequestSigner>,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
    ) -> Self {
        Self { settings, http, signer, gate, retry, clock_offset_ms: AtomicI64::new(0) }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub fn timestamp_ms(&self) -> i64 {
        crate::now_ms() + self.clock_offset_ms()
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms.load(Ordering::Relaxed)
    }

    /// Re-read the marketplace clock and store our offset from it.
    pub async fn sync_clock(&self) -> Result<i64, ApiError> {
        let sent = crate::now_ms();
        let res = self.http.get(self.url(&self.settings.time_path)).timeout(self.settings.timeout()).send().await?;
        if !res.status().is_success() {
            return Err(ApiError::from_status(res.status().as_u16()));
        }
        let body: TimeResponse = res.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        let received = crate::now_ms();
        let offset = body.server_time as i64 - (sent + received) / 2;
        self.clock_offset_ms.store(offset, Ordering::Relaxed);
        info!(offset_ms = offset, "Marketplace clock resynchronised");
        Ok(offset)
    }

    // Shared post-processing for both endpoint classes.
    async fn settle<T>(&self, class: EndpointClass, result: Result<T, ApiError>) -> Result<T, ApiError> {
        match result {
            Ok(v) => {
                self.gate.relax(class).await;
                Ok(v)
            }
            Err(ApiError::Throttled) => {
                metrics::counter!("p2p_api_throttled", "endpoint" => format!("{class:?}")).increment(1);
                self.gate.throttled(class).await;
                Err(ApiError::Throttled)
            }
            Err(ApiError::ClockSkew) => {
                if let Err(e) = self.sync_clock().await {
                    warn!(error = %e, "Clock resync failed");
                }
                Err(ApiError::ClockSkew)
            }
            Err(e) => Err(e),
        }
    }

    fn status_error(status: StatusCode) -> Option<ApiError> {
        (!status.is_success()).then(|| ApiError::from_status(status.as_u16()))
    }

    async fn update_once(&self, listing_id: &str, new_ratio: f64) -> Result<(), ApiError> {
        self.gate.wait(EndpointClass::Update).await;
        let timestamp = self.timestamp_ms();
        let mut query = vec![("timestamp".to_string(), timestamp.to_string())];
        query.extend(self.signer.sign(&format!("timestamp={timestamp}")));

        let mut request = self
            .http
            .post(self.url(&self.settings.update_path))
            .query(&query)
            .timeout(self.settings.timeout())
            .json(&UpdateRequest { adv_no: listing_id.to_string(), price_floating_ratio: new_ratio });
        for (name, value) in self.signer.headers() {
            request = request.header(name, value);
        }

        let result: Result<(), ApiError> = async {
            let res = request.send().await?;
            if let Some(e) = Self::status_error(res.status()) {
                return Err(e);
            }
            let body: UpdateResponse = res.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
            body.into_result()
        }
        .await;
        self.settle(EndpointClass::Update, result).await
    }
}

#[async_trait]
impl MarketplaceApi for HttpMarketplaceClient {
    #[instrument(level = "debug", skip(self), fields(query = %params))]
    async fn search_page(&self, params: &SearchParams, page: u32) -> Result<Vec<RivalQuote>, ApiError> {
        self.gate.wait(EndpointClass::Search).await;
        let mut request = self
            .http
            .post(self.url(&self.settings.search_path))
            .timeout(self.settings.timeout())
            .json(&params.request(page));
        for (name, value) in self.signer.headers() {
            request = request.header(name, value);
        }

        let result: Result<Vec<RivalQuote>, ApiError> = async {
            let res = request.send().await?;
            if let Some(e) = Self::status_error(res.status()) {
                return Err(e);
            }
            let body: SearchResponse = res.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
            body.into_rivals()
        }
        .await;
        let rivals = self.settle(EndpointClass::Search, result).await?;
        debug!(page, count = rivals.len(), "Search page fetched");
        Ok(rivals)
    }

    #[instrument(level = "debug", skip(self))]
    async fn update_ratio(&self, listing_id: &str, new_ratio: f64) -> Result<(), ApiError> {
        if self.settings.dry_run {
            info!(listing_id, new_ratio, "Dry run, update not sent");
            return Ok(());
        }
        self.retry
            .retry("update_ratio", |_| self.update_once(listing_id, new_ratio), ApiError::is_transient)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::StubHttp;
    use std::time::Duration;

    fn settings(dry_run: bool) -> MarketplaceConfig {
        MarketplaceConfig {
            base_url: "http://127.0.0.1:9/".into(),
            search_path: "/bapi/c2c/v2/friendly/c2c/adv/search".into(),
            update_path: "/sapi/v1/c2c/ads/update".into(),
            time_path: "/api/v3/time".into(),
            timeout_ms: 200,
            search_interval_ms: 0,
            update_interval_ms: 0,
            max_interval_ms: 1000,
            rows: 10,
            dry_run,
        }
    }

    fn client(dry_run: bool) -> HttpMarketplaceClient {
        client_for(settings(dry_run))
    }

    fn client_for(settings: MarketplaceConfig) -> HttpMarketplaceClient {
        HttpMarketplaceClient::new(
            settings,
            reqwest::Client::new(),
            Arc::new(UnsignedRequests),
            Arc::new(RateGate::new(Duration::ZERO, Duration::ZERO, Duration::from_secs(1))),
            RetryPolicy::new(Duration::ZERO, Duration::ZERO, Some(2)),
        )
    }

    #[test]
    fn test_url_join() {
        let c = client(true);
        assert_eq!(c.url("/api/v3/time"), "http://127.0.0.1:9/api/v3/time");
        assert_eq!(c.url("api/v3/time"), "http://127.0.0.1:9/api/v3/time");
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        // nothing listens on the discard port; a real call would fail
        assert_eq!(client(true).update_ratio("ad-1", 99.5).await, Ok(()));
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let err = client(false).update_ratio("ad-1", 99.5).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn test_throttle_widens_gate() {
        let c = client(false);
        let res: Result<(), ApiError> = c.settle(EndpointClass::Update, Err(ApiError::Throttled)).await;
        assert_eq!(res, Err(ApiError::Throttled));
        assert!(c.gate.interval(EndpointClass::Update).await > Duration::ZERO);
        assert_eq!(c.gate.interval(EndpointClass::Search).await, Duration::ZERO);
    }

    fn timestamp_of(line: &str) -> i64 {
        line.split_once("timestamp=").and_then(|(_, t)| t.split('&').next()).unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_clock_skew_resyncs_then_retries() {
        let server_time = crate::now_ms() + 60_000;
        let stub = StubHttp::start(vec![
            (200, r#"{"code":"-1021","msg":"Timestamp for this request is outside of the recvWindow."}"#.into()),
            (200, format!(r#"{{"serverTime":{server_time}}}"#)),
            (200, r#"{"code":"000000","msg":"success"}"#.into()),
        ])
        .await;
        let c = client_for(MarketplaceConfig { base_url: stub.base_url.clone(), ..settings(false) });
        assert_eq!(c.clock_offset_ms(), 0);

        assert_eq!(c.update_ratio("ad-1", 99.5).await, Ok(()));

        let offset = c.clock_offset_ms();
        assert!((offset - 60_000).abs() < 5_000, "offset {offset}");
        let lines = stub.request_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("POST /sapi/v1/c2c/ads/update?timestamp="));
        assert_eq!(lines[1], "GET /api/v3/time");
        assert!(lines[2].starts_with("POST /sapi/v1/c2c/ads/update?timestamp="));
        // the retry is stamped with the marketplace clock
        assert!(timestamp_of(&lines[2]) - timestamp_of(&lines[0]) > 50_000);
    }

    #[tokio::test]
    async fn test_client_error_status_is_not_retried() {
        let stub = StubHttp::start(vec![(400, "{}".into()), (200, r#"{"code":"000000"}"#.into())]).await;
        let c = client_for(MarketplaceConfig { base_url: stub.base_url.clone(), ..settings(false) });
        assert_eq!(c.update_ratio("ad-1", 99.5).await, Err(ApiError::Status(400)));
        assert_eq!(stub.request_lines().len(), 1);
    }

    #[tokio::test]
    async fn test_server_error_status_is_retried() {
        let stub = StubHttp::start(vec![(502, String::new()), (200, r#"{"code":"000000"}"#.into())]).await;
        let c = client_for(MarketplaceConfig { base_url: stub.base_url.clone(), ..settings(false) });
        assert_eq!(c.update_ratio("ad-1", 99.5).await, Ok(()));
        assert_eq!(stub.request_lines().len(), 2);
    }
}
