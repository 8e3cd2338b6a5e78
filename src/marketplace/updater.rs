use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::engine::registry::ListingRegistry;
use crate::engine::types::{round2, Decision, Listing};
use crate::marketplace::client::MarketplaceApi;
use crate::marketplace::types::ApiError;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Decision was not an update; no call made.
    Skipped,
    Updated { ratio: f64, price: f64 },
    /// Marketplace no longer knows the listing; marked inactive.
    Delisted,
    Rejected(ApiError),
    Failed(ApiError),
}

pub struct QuoteUpdater {
    api: Arc<dyn MarketplaceApi>,
    registry: Arc<ListingRegistry>,
}

impl QuoteUpdater {
    pub fn new(api: Arc<dyn MarketplaceApi>, registry: Arc<ListingRegistry>) -> Self {
        Self { api, registry }
    }

    #[instrument(level = "debug", skip_all, fields(id = %listing.id))]
    pub async fn apply(&self, listing: &Listing, decision: &Decision) -> UpdateOutcome {
        let Decision::Update { new_ratio, rival_id, rival_ratio } = decision else {
            return UpdateOutcome::Skipped;
        };
        // base_price was validated by the ratio computation
        let Some(base_price) = listing.base_price() else {
            return UpdateOutcome::Skipped;
        };

        match self.api.update_ratio(&listing.id, *new_ratio).await {
            Ok(()) => {
                let price = round2(base_price * new_ratio / 100.0);
                self.registry.record_update(&listing.id, *new_ratio, price, crate::now_ms());
                info!(from = listing.ratio, to = new_ratio, price, rival = %rival_id, rival_ratio, "Listing ratio updated");
                metrics::counter!("p2p_updates", "outcome" => "updated").increment(1);
                UpdateOutcome::Updated { ratio: *new_ratio, price }
            }
            Err(ApiError::NotFound) => {
                self.registry.mark_inactive(&listing.id, crate::now_ms());
                warn!("Listing delisted by marketplace, marked inactive");
                metrics::counter!("p2p_updates", "outcome" => "delisted").increment(1);
                UpdateOutcome::Delisted
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Update failed after retries");
                metrics::counter!("p2p_updates", "outcome" => "failed").increment(1);
                UpdateOutcome::Failed(e)
            }
            Err(e) => {
                warn!(error = %e, "Update rejected");
                metrics::counter!("p2p_updates", "outcome" => "rejected").increment(1);
                UpdateOutcome::Rejected(e)
            }
        }
    }
}
