// Convert wire decimal strings into internal integer ticks/lots so book keys are
// exact. Scales are fixed per feed.

use crate::market_data::types::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normaliser {
    pub price_decimals: u32,
    pub size_decimals: u32,
    pub price_scale: i64, // e.g. 1_000_000 => 6 decimal places
    pub size_scale: u64,
}

impl Normaliser {
    pub fn new(price_decimals: u32, size_decimals: u32) -> Self {
        Self {
            price_decimals,
            size_decimals,
            price_scale: 10i64.saturating_pow(price_decimals),
            size_scale: 10u64.saturating_pow(size_decimals),
        }
    }

    pub fn price_to_ticks(&self, s: &str) -> Result<i64, FeedError> {
        parse_scaled(s, self.price_decimals)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(|| FeedError::Malformed(format!("bad price {s:?}")))
    }

    pub fn size_to_lots(&self, s: &str) -> Result<u64, FeedError> {
        parse_scaled(s, self.size_decimals)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| FeedError::Malformed(format!("bad amount {s:?}")))
    }

    pub fn ticks_to_price(&self, ticks: i64) -> f64 {
        ticks as f64 / self.price_scale as f64
    }

    pub fn lots_to_size(&self, lots: u64) -> f64 {
        lots as f64 / self.size_scale as f64
    }
}

// Non-negative decimal -> integer with `decimals` fractional digits. Extra
// fractional digits are truncated, missing ones are zero-padded.
fn parse_scaled(s: &str, decimals: u32) -> Option<u128> {
    let s = s.trim();
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let integer: u128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let width = decimals as usize;
    let frac: u128 = if width == 0 {
        0
    } else if frac_part.len() >= width {
        frac_part[..width].parse().ok()?
    } else {
        format!("{:0<width$}", frac_part, width = width).parse().ok()?
    };

    integer.checked_mul(10u128.checked_pow(decimals)?)?.checked_add(frac)
}
