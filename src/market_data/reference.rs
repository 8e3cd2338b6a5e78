use std::sync::Arc;

use crate::cache::WriteThrough;

/// Latest weighted execution prices for one asset/fiat pair. A side at 0.0
/// means the book was too thin for the target notional.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReferencePrices {
    pub bid: f64,
    pub ask: f64,
    pub sequence: u64,
    pub updated_at_ms: i64,
}

impl ReferencePrices {
    pub fn is_degraded(&self) -> bool {
        self.bid <= 0.0 || self.ask <= 0.0
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.updated_at_ms)
    }
}

/// The only state shared between feed tasks and the pricing loop. Created
/// once in `main`, cloned into every feed and into the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ReferencePriceCache {
    prices: Arc<WriteThrough<String, ReferencePrices>>,
}

/// Cache key for one asset/fiat pair, e.g. `USDT/MXN`.
pub fn pair_key(asset: &str, fiat: &str) -> String {
    format!("{}/{}", asset.to_ascii_uppercase(), fiat.to_ascii_uppercase())
}

impl ReferencePriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, asset: &str, fiat: &str) -> Option<ReferencePrices> {
        self.prices.get(&pair_key(asset, fiat))
    }

    pub fn get_pair(&self, key: &str) -> Option<ReferencePrices> {
        self.prices.get(&key.to_string())
    }

    pub fn set(&self, asset: &str, fiat: &str, prices: ReferencePrices) {
        self.prices.set(pair_key(asset, fiat), prices);
    }

    /// Pairs whose prices changed since the previous flush.
    pub fn flush(&self) -> Vec<(String, ReferencePrices)> {
        self.prices.take_dirty()
    }
}
