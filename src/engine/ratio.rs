//! Ratio decision for one listing against the ranked rival list.
//!
//! BUY listings rank by lowest price and undercut; SELL listings rank by
//! highest price and overcut. The threshold multiplier keeps the quote away
//! from rivals priced beyond what the operator is willing to match, and may
//! follow the live reference price when it moves far enough.

use tracing::{debug, instrument, trace};

use crate::engine::thresholds::ThresholdTable;
use crate::engine::types::{round2, Decision, Listing, NoChangeReason, PricingError, RivalQuote, Side};
use crate::market_data::ReferencePrices;

#[derive(Debug, Clone, PartialEq)]
pub struct PricingParams {
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub adjustment_step: f64,
    /// Minimum ratio gap before a listing that already beats its rival moves.
    pub hysteresis: f64,
    /// Changes smaller than this are not pushed.
    pub epsilon: f64,
    /// Reference-driven threshold changes at or below this are ignored.
    pub threshold_min_change: f64,
    pub buy_threshold_ceiling: f64,
    pub sell_threshold_floor: f64,
    pub thresholds: ThresholdTable,
}

#[derive(Debug, Clone)]
pub struct RatioComputer {
    params: PricingParams,
}

impl RatioComputer {
    pub fn new(params: PricingParams) -> Self {
        Self { params }
    }

    fn clamp_threshold(&self, side: Side, threshold: f64) -> f64 {
        match side {
            Side::BUY => threshold.min(self.params.buy_threshold_ceiling),
            Side::SELL => threshold.max(self.params.sell_threshold_floor),
        }
    }

    /// Threshold multiplier for this listing, nudged toward the live
    /// reference price (ask for BUY, bid for SELL) when it differs enough.
    pub fn effective_threshold(&self, listing: &Listing, base_price: f64, reference: Option<&ReferencePrices>) -> f64 {
        let configured = self.params.thresholds.multiplier(listing.side, &listing.payment_methods);
        let reference_price = match (listing.side, reference) {
            (Side::BUY, Some(r)) => r.ask,
            (Side::SELL, Some(r)) => r.bid,
            (_, None) => 0.0,
        };
        if reference_price <= 0.0 || base_price <= 0.0 {
            return self.clamp_threshold(listing.side, configured);
        }
        let candidate = reference_price / base_price;
        if (candidate - configured).abs() <= self.params.threshold_min_change {
            return self.clamp_threshold(listing.side, configured);
        }
        trace!(id = %listing.id, configured, candidate, "Threshold follows reference price");
        self.clamp_threshold(listing.side, candidate)
    }

    #[instrument(level = "debug", skip_all, fields(id = %listing.id, side = listing.side.as_str()))]
    pub fn compute(
        &self,
        listing: &Listing,
        rivals: &[RivalQuote],
        reference: Option<&ReferencePrices>,
    ) -> Result<Decision, PricingError> {
        let base_price = listing.base_price().ok_or_else(|| PricingError::InvalidListing {
            id: listing.id.clone(),
            price: listing.price,
            ratio: listing.ratio,
        })?;
        let threshold = self.effective_threshold(listing, base_price, reference);
        let limit_price = base_price * threshold;

        let filtered: Vec<&RivalQuote> = rivals
            .iter()
            .filter(|r| r.id != listing.id)
            .filter(|r| r.price.is_finite() && r.price > 0.0)
            .filter(|r| match listing.side {
                Side::BUY => r.price > limit_price,
                Side::SELL => r.price < limit_price,
            })
            .filter(|r| r.bounds.overlaps(&listing.bounds))
            .collect();
        if filtered.is_empty() {
            debug!(rivals = rivals.len(), limit_price, "No usable rival");
            return Ok(Decision::InsufficientData);
        }

        let rank = (listing.target_rank.max(1) as usize).min(filtered.len());
        let rival = filtered[rank - 1];
        let rival_ratio = rival.price / base_price * 100.0;
        let beating = match listing.side {
            Side::BUY => listing.price < rival.price,
            Side::SELL => listing.price > rival.price,
        };
        if beating && (rival_ratio - listing.ratio).abs() <= self.params.hysteresis {
            return Ok(Decision::NoChange(NoChangeReason::WithinHysteresis));
        }

        let target = match listing.side {
            Side::BUY => (rival_ratio - self.params.adjustment_step).max(threshold * 100.0),
            Side::SELL => (rival_ratio + self.params.adjustment_step).min(threshold * 100.0),
        };
        let new_ratio = round2(target).clamp(self.params.min_ratio, self.params.max_ratio);
        if (new_ratio - listing.ratio).abs() < self.params.epsilon {
            return Ok(Decision::NoChange(NoChangeReason::BelowEpsilon));
        }

        debug!(rank, rival = %rival.id, rival_ratio, current = listing.ratio, new_ratio, "Ratio change");
        Ok(Decision::Update { new_ratio, rival_id: rival.id.clone(), rival_ratio: round2(rival_ratio) })
    }
}
