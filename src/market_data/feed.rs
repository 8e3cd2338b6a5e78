// Diff-orders feed for one book: connect, subscribe, snapshot, reconcile,
// publish reference prices. Any stream failure rebuilds the book from a new
// snapshot on the next connection.

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::FeedConfig;
use crate::market_data::normaliser::Normaliser;
use crate::market_data::order_book::OrderBook;
use crate::market_data::reference::{ReferencePriceCache, ReferencePrices};
use crate::market_data::sync::{BookSync, SyncOutcome};
use crate::market_data::types::{self, BookSnapshot, FeedError, RestSnapshotResponse};
use crate::retry::RetryPolicy;

pub struct OrderBookEngine {
    settings: FeedConfig,
    normaliser: Normaliser,
    http: reqwest::Client,
    cache: ReferencePriceCache,
    reconnect: RetryPolicy,
}

impl OrderBookEngine {
    pub fn new(settings: FeedConfig, cache: ReferencePriceCache, http: reqwest::Client, reconnect: RetryPolicy) -> Self {
        let normaliser = Normaliser::new(settings.price_decimals, settings.size_decimals);
        Self { settings, normaliser, http, cache, reconnect }
    }

    pub fn book_name(&self) -> &str {
        &self.settings.book
    }

    /// Latest published `(weighted_bid, weighted_ask)`; zeros until the first
    /// snapshot has been applied.
    pub fn reference_prices(&self) -> (f64, f64) {
        self.cache
            .get(&self.settings.asset, &self.settings.fiat)
            .map(|p| (p.bid, p.ask))
            .unwrap_or((0.0, 0.0))
    }

    /// Run until `shutdown` flips to true. Never returns on a recoverable
    /// error: every failure goes through the reconnect policy.
    #[instrument(skip_all, fields(book = %self.settings.book))]
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut sync = BookSync::new(self.settings.max_buffered_diffs);
            match self.stream_once(&mut sync, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    if sync.is_synced() {
                        attempt = 0;
                    }
                    metrics::counter!("p2p_feed_reconnects", "book" => self.settings.book.clone()).increment(1);
                    warn!(error = %e, attempt, last_sequence = sync.book().sequence, "Feed connection lost");
                }
            }
            if !self.reconnect.allows(attempt + 1) {
                error!(attempt, "Reconnect attempts exhausted, feed stopped");
                break;
            }
            let delay = self.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting feed");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Feed stopped");
    }

    // One connection attempt. Ok(()) only on shutdown.
    async fn stream_once(&self, sync: &mut BookSync, shutdown: &mut watch::Receiver<bool>) -> Result<(), FeedError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.settings.ws_url.as_str())
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = serde_json::json!({
            "action": "subscribe",
            "book": self.settings.book,
            "type": "diff-orders",
        });
        write
            .send(Message::Text(subscribe_msg.to_string()))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        info!(url = %self.settings.ws_url, "Subscribed to diff-orders");

        // Snapshot is fetched while diffs are already being buffered.
        let snapshot = self.fetch_snapshot();
        tokio::pin!(snapshot);
        let mut snapshot_pending = true;
        let idle = self.settings.idle_timeout();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                res = &mut snapshot, if snapshot_pending => {
                    snapshot_pending = false;
                    let snap = res?;
                    let replayed = sync.on_snapshot(snap);
                    info!(sequence = sync.book().sequence, replayed, "Order book snapshot applied");
                    self.publish(sync.book());
                }
                msg = tokio::time::timeout(idle, read.next()) => {
                    match msg {
                        Err(_) => return Err(FeedError::Idle(idle)),
                        Ok(None) => return Err(FeedError::Closed),
                        Ok(Some(Err(e))) => return Err(FeedError::Transport(e.to_string())),
                        Ok(Some(Ok(Message::Text(text)))) => self.handle_text(sync, &text)?,
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            write.send(Message::Pong(payload)).await.map_err(|e| FeedError::Transport(e.to_string()))?;
                        }
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            debug!(?frame, "Close frame received");
                            return Err(FeedError::Closed);
                        }
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
    }

    // Malformed frames are dropped; only a sequencing gap ends the attempt.
    fn handle_text(&self, sync: &mut BookSync, text: &str) -> Result<(), FeedError> {
        match types::parse_frame(text, &self.settings.book, &self.normaliser) {
            Ok(Some(diff)) => {
                let sequence = diff.sequence;
                match sync.on_diff(diff)? {
                    SyncOutcome::Applied => {
                        metrics::counter!("p2p_feed_diffs_applied", "book" => self.settings.book.clone()).increment(1);
                        self.publish(sync.book());
                    }
                    SyncOutcome::Stale => trace!(sequence, book_sequence = sync.book().sequence, "Stale diff dropped"),
                    SyncOutcome::Buffered => trace!(sequence, buffered = sync.buffered(), "Diff buffered before snapshot"),
                }
            }
            Ok(None) => trace!("Control frame ignored"),
            Err(e) => {
                metrics::counter!("p2p_feed_diffs_dropped", "book" => self.settings.book.clone()).increment(1);
                warn!(error = %e, "Dropping malformed diff");
            }
        }
        Ok(())
    }

    async fn fetch_snapshot(&self) -> Result<BookSnapshot, FeedError> {
        let res = self
            .http
            .get(&self.settings.rest_url)
            .query(&[("book", self.settings.book.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FeedError::Snapshot(e.to_string()))?;
        let body: RestSnapshotResponse = res.json().await.map_err(|e| FeedError::Snapshot(e.to_string()))?;
        match body.payload {
            Some(payload) if body.success => payload.normalise(&self.normaliser),
            _ => Err(FeedError::Snapshot("snapshot response without success payload".into())),
        }
    }

    // Full recomputation after every change; book depth is bounded.
    fn publish(&self, book: &OrderBook) {
        let (bid, ask) = book.reference_prices(self.settings.target_notional, &self.normaliser);
        let prices = ReferencePrices { bid, ask, sequence: book.sequence, updated_at_ms: crate::now_ms() };
        self.cache.set(&self.settings.asset, &self.settings.fiat, prices);
        if prices.is_degraded() {
            debug!(
                bid,
                ask,
                best_bid = ?book.best_bid().map(|l| l.price),
                best_ask = ?book.best_ask().map(|l| l.price),
                "Book too thin for target notional"
            );
        }
        metrics::gauge!("p2p_reference_price", "book" => self.settings.book.clone(), "side" => "bid").set(bid);
        metrics::gauge!("p2p_reference_price", "book" => self.settings.book.clone(), "side" => "ask").set(ask);
    }
}
