use std::collections::BTreeMap;

use tracing::{debug, instrument, trace};

use crate::market_data::normaliser::Normaliser;
use crate::market_data::types::{BookSide, BookSnapshot, DiffMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub price: i64,  // ticks
    pub amount: u64, // lots
}

/// Mirror of one remote book. Keys are price ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBook {
    pub bids: BTreeMap<i64, Level>, // highest price = best bid
    pub asks: BTreeMap<i64, Level>, // lowest price  = best ask
    pub sequence: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    // Replace the whole book with a fresh snapshot
    pub fn load_snapshot(&mut self, snap: &BookSnapshot) {
        self.bids.clear();
        self.asks.clear();
        for &(price, amount) in snap.bids.iter().filter(|(_, a)| *a > 0) {
            self.bids.insert(price, Level { price, amount });
        }
        for &(price, amount) in snap.asks.iter().filter(|(_, a)| *a > 0) {
            self.asks.insert(price, Level { price, amount });
        }
        self.sequence = snap.sequence;
        debug!(sequence = snap.sequence, bids = self.bids.len(), asks = self.asks.len(), "Loaded snapshot");
    }

    /// Apply one sequenced diff. Returns false (and leaves the book untouched)
    /// for duplicates and late arrivals.
    #[instrument(level = "trace", skip(self, diff), fields(sequence = diff.sequence))]
    pub fn apply_diff(&mut self, diff: &DiffMessage) -> bool {
        if diff.sequence <= self.sequence {
            trace!(book_sequence = self.sequence, "Dropping stale diff");
            return false;
        }
        for entry in &diff.entries {
            let side = match entry.side {
                BookSide::Bid => &mut self.bids,
                BookSide::Ask => &mut self.asks,
            };
            if entry.is_removal() {
                side.remove(&entry.price);
            } else {
                side.insert(entry.price, Level { price: entry.price, amount: entry.remaining });
            }
        }
        self.sequence = diff.sequence;
        true
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids.values().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.values().next().copied()
    }

    /// Weighted-average execution price for `target_notional` on one side,
    /// walking from the best level outward. 0.0 when depth is insufficient.
    pub fn weighted_price(&self, side: BookSide, target_notional: f64, norm: &Normaliser) -> f64 {
        match side {
            BookSide::Bid => walk_levels(self.bids.values().rev(), target_notional, norm),
            BookSide::Ask => walk_levels(self.asks.values(), target_notional, norm),
        }
    }

    /// `(weighted_bid, weighted_ask)` for the same target notional.
    pub fn reference_prices(&self, target_notional: f64, norm: &Normaliser) -> (f64, f64) {
        (
            self.weighted_price(BookSide::Bid, target_notional, norm),
            self.weighted_price(BookSide::Ask, target_notional, norm),
        )
    }
}

// Notional is accumulated in exact ticks x lots so a book that covers the
// target to the last unit is never reported as too thin.
fn walk_levels<'a>(levels: impl Iterator<Item = &'a Level>, target: f64, norm: &Normaliser) -> f64 {
    if target.is_nan() || target <= 0.0 {
        return 0.0;
    }
    let unit_scale = norm.price_scale as f64 * norm.size_scale as f64;
    let target_units = (target * unit_scale).round() as u128;
    if target_units == 0 {
        return 0.0;
    }
    let mut notional: u128 = 0;
    let mut lots: u128 = 0;
    for level in levels {
        if level.price <= 0 || level.amount == 0 {
            continue;
        }
        let ticks = level.price as u128;
        let needed = target_units - notional;
        let level_notional = ticks * level.amount as u128;
        if level_notional >= needed {
            // final level is only partially consumed
            let quantity = lots as f64 + needed as f64 / ticks as f64;
            return target_units as f64 / quantity / norm.price_scale as f64;
        }
        notional += level_notional;
        lots += level.amount as u128;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::types::DiffEntry;

    fn norm() -> Normaliser {
        Normaliser::new(2, 8)
    }

    // (price, amount) in human units
    fn snapshot(sequence: u64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> BookSnapshot {
        let n = norm();
        let conv = |levels: &[(f64, f64)]| {
            levels
                .iter()
                .map(|(p, a)| ((p * n.price_scale as f64).round() as i64, (a * n.size_scale as f64).round() as u64))
                .collect()
        };
        BookSnapshot { sequence, bids: conv(bids), asks: conv(asks) }
    }

    fn diff(sequence: u64, side: BookSide, price: i64, remaining: u64) -> DiffMessage {
        DiffMessage { sequence, entries: vec![DiffEntry { side, price, remaining }] }
    }

    #[test]
    fn test_snapshot_replaces_book() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(5, &[(1.0, 1.0)], &[(2.0, 1.0)]));
        book.load_snapshot(&snapshot(9, &[(3.0, 1.0), (4.0, 0.0)], &[]));
        assert_eq!(book.sequence, 9);
        assert_eq!(book.bids.len(), 1);
        assert!(book.asks.is_empty());
        assert_eq!(book.best_bid().unwrap().price, 300);
    }

    #[test]
    fn test_stale_and_duplicate_diffs_dropped() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(10, &[(1.0, 1.0)], &[]));
        assert!(!book.apply_diff(&diff(10, BookSide::Bid, 100, 0)));
        assert!(!book.apply_diff(&diff(3, BookSide::Bid, 100, 0)));
        assert_eq!(book.bids.len(), 1);
        assert!(book.apply_diff(&diff(11, BookSide::Bid, 100, 5)));
        assert_eq!(book.bids[&100].amount, 5);
        assert_eq!(book.sequence, 11);
    }

    #[test]
    fn test_weighted_price_on_level_boundary() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(1, &[(9.0, 100.0), (8.0, 100.0)], &[(10.0, 100.0), (11.0, 100.0)]));
        let n = norm();
        // exactly the first ask level
        assert!((book.weighted_price(BookSide::Ask, 1000.0, &n) - 10.0).abs() < 1e-9);
        // exactly both ask levels: 2100 / 200
        assert!((book.weighted_price(BookSide::Ask, 2100.0, &n) - 10.5).abs() < 1e-9);
        // bids walk downward from 9.0: 900 + 800 over 200 units
        assert!((book.weighted_price(BookSide::Bid, 1700.0, &n) - 8.5).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_price_exact_cover_on_awkward_decimals() {
        // 18.00 x 0.3 is 5.4 exactly in ticks and lots but not in f64
        let mut book = OrderBook::new();
        book.load_snapshot(&BookSnapshot { sequence: 1, bids: vec![], asks: vec![(1800, 30_000_000)] });
        let n = norm();
        assert_eq!(book.weighted_price(BookSide::Ask, 5.4, &n), 18.0);

        book.load_snapshot(&BookSnapshot { sequence: 2, bids: vec![(1933, 70_000_000), (1917, 10_000_000)], asks: vec![] });
        // 13.531 + 1.917 = 15.448
        let expected = 15.448 / 0.8;
        assert!((book.weighted_price(BookSide::Bid, 15.448, &n) - expected).abs() < 1e-9);
        assert_eq!(book.weighted_price(BookSide::Bid, 15.449, &n), 0.0);
    }

    #[test]
    fn test_weighted_price_partial_level() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(1, &[], &[(10.0, 100.0), (11.0, 100.0)]));
        let n = norm();
        // 1000 at 10.0 (100 units) + 550 at 11.0 (50 units)
        let expected = (10.0 * 100.0 + 11.0 * 50.0) / 150.0;
        assert!((book.weighted_price(BookSide::Ask, 1550.0, &n) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_price_insufficient_depth_is_zero() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(1, &[(9.0, 1.0)], &[]));
        let (bid, ask) = book.reference_prices(100.0, &norm());
        assert_eq!(bid, 0.0);
        assert_eq!(ask, 0.0);
        assert_eq!(book.weighted_price(BookSide::Bid, 0.0, &norm()), 0.0);
    }

    #[test]
    fn test_reference_scenario() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(100, &[(19.00, 1000.0)], &[(19.10, 1000.0)]));
        assert!(!book.apply_diff(&diff(99, BookSide::Bid, 1900, 0)));
        assert_eq!(book.bids.len(), 1);
        assert!(book.apply_diff(&diff(101, BookSide::Bid, 1900, 0)));
        assert!(book.bids.is_empty());

        let (bid, ask) = book.reference_prices(5000.0, &norm());
        assert_eq!(bid, 0.0);
        assert!((ask - 19.10).abs() < 1e-9);
    }
}
