use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    BUY,
    SELL
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::BUY => "BUY",
            Side::SELL => "SELL",
        }
    }
}

/// Payment rails a listing can accept. Closed set; thresholds are keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    CashDeposit,
    DigitalWallet,
    Card,
}

impl PaymentMethod {
    /// Identifier the marketplace search endpoint expects.
    pub fn api_tag(&self) -> &'static str {
        match self {
            PaymentMethod::BankTransfer => "BankTransfer",
            PaymentMethod::CashDeposit => "CashDeposit",
            PaymentMethod::DigitalWallet => "DigitalWallet",
            PaymentMethod::Card => "Card",
        }
    }
}

/// Fiat transaction-amount window of a listing or rival quote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmountBounds {
    pub min: f64,
    pub max: f64,
}

impl AmountBounds {
    pub fn overlaps(&self, other: &AmountBounds) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

fn default_active() -> bool {
    true
}

// Operator-owned quote, as loaded from storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub side: Side,
    pub asset: String,
    pub fiat: String,
    pub price: f64,
    /// Percentage of base price; 100 = priced exactly at base.
    pub ratio: f64,
    pub target_rank: u32,
    pub bounds: AmountBounds,
    pub payment_methods: Vec<PaymentMethod>,
    /// Listings sharing a key share one rival scan per pass.
    #[serde(default)]
    pub group_key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl Listing {
    /// `price / (ratio / 100)`; None when either input is not positive.
    pub fn base_price(&self) -> Option<f64> {
        if !(self.price.is_finite() && self.ratio.is_finite()) || self.price <= 0.0 || self.ratio <= 0.0 {
            return None;
        }
        Some(self.price / (self.ratio / 100.0))
    }

    /// Key derived from the rival-query shape, used when storage has none.
    pub fn derived_group_key(&self) -> String {
        let mut methods: Vec<&str> = self.payment_methods.iter().map(|m| m.api_tag()).collect();
        methods.sort_unstable();
        format!("{}:{}:{}:{}:{}", self.asset, self.fiat, self.side.as_str(), methods.join(","), self.bounds.min)
    }

    pub fn with_group_key(mut self) -> Self {
        if self.group_key.is_empty() {
            self.group_key = self.derived_group_key();
        }
        self
    }
}

// Rival listing as ranked by the marketplace
#[derive(Debug, Clone, PartialEq)]
pub struct RivalQuote {
    pub id: String,
    pub price: f64,
    pub bounds: AmountBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoChangeReason {
    /// Already ahead of the rival and the gap is within hysteresis.
    WithinHysteresis,
    /// Computed ratio equals the current one at marketplace precision.
    BelowEpsilon,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Update { new_ratio: f64, rival_id: String, rival_ratio: f64 },
    NoChange(NoChangeReason),
    /// No usable rival after filtering; never price on this.
    InsufficientData,
}

impl Decision {
    pub fn is_update(&self) -> bool {
        matches!(self, Decision::Update { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PricingError {
    #[error("listing {id} has invalid price {price} / ratio {ratio}")]
    InvalidListing { id: String, price: f64, ratio: f64 },
}

/// Marketplace precision for ratios and prices.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
