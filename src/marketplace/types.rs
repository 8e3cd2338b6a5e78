use serde::{Deserialize, Serialize};

use crate::engine::types::{AmountBounds, Listing, PaymentMethod, RivalQuote, Side};
use crate::wire::{f64_flex, opt_string_or_number, string_or_number};

pub const CODE_SUCCESS: [&str; 3] = ["000000", "0", "200"];
pub const CODE_CLOCK_SKEW: &str = "-1021";
pub const CODE_THROTTLED: &str = "-1003";
pub const CODE_NOT_FOUND: [&str; 2] = ["-9000", "83229"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("throttled by marketplace")]
    Throttled,
    #[error("request timestamp outside the accepted window")]
    ClockSkew,
    #[error("listing not found")]
    NotFound,
    #[error("rejected with code {code}: {msg}")]
    Rejected { code: String, msg: String },
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Worth another attempt. Client-side statuses (4xx) fail the same way
    /// on every retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status(status) => *status >= 500,
            ApiError::Transport(_) | ApiError::Timeout | ApiError::Throttled | ApiError::ClockSkew => true,
            ApiError::NotFound | ApiError::Rejected { .. } | ApiError::Decode(_) => false,
        }
    }

    /// Classify a non-success response code.
    pub fn from_code(code: &str, msg: Option<String>) -> Self {
        match code {
            CODE_CLOCK_SKEW => ApiError::ClockSkew,
            CODE_THROTTLED => ApiError::Throttled,
            c if CODE_NOT_FOUND.contains(&c) => ApiError::NotFound,
            c => ApiError::Rejected { code: c.to_string(), msg: msg.unwrap_or_default() },
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 418 => ApiError::Throttled,
            404 => ApiError::NotFound,
            s => ApiError::Status(s),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::from_status(status.as_u16())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

pub fn is_success_code(code: &str) -> bool {
    CODE_SUCCESS.contains(&code)
}

/// One rival query. Listings with the same group key produce equal params.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub asset: String,
    pub fiat: String,
    pub side: Side,
    pub trans_amount: Option<f64>,
    pub payment_methods: Vec<PaymentMethod>,
    pub rows: u32,
}

impl SearchParams {
    pub fn for_listing(listing: &Listing, rows: u32) -> Self {
        let mut payment_methods = listing.payment_methods.clone();
        payment_methods.sort_unstable();
        payment_methods.dedup();
        Self {
            asset: listing.asset.clone(),
            fiat: listing.fiat.clone(),
            side: listing.side,
            trans_amount: (listing.bounds.min > 0.0).then_some(listing.bounds.min),
            payment_methods,
            rows,
        }
    }

    pub fn request(&self, page: u32) -> SearchRequest {
        SearchRequest {
            asset: self.asset.clone(),
            fiat: self.fiat.clone(),
            trade_type: self.side.as_str().to_string(),
            trans_amount: self.trans_amount,
            pay_types: self.payment_methods.iter().map(|m| m.api_tag().to_string()).collect(),
            page,
            rows: self.rows,
        }
    }
}

impl std::fmt::Display for SearchParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.side.as_str(), self.asset, self.fiat)?;
        if let Some(amount) = self.trans_amount {
            write!(f, " @{amount}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub asset: String,
    pub fiat: String,
    pub trade_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trans_amount: Option<f64>,
    pub pay_types: Vec<String>,
    pub page: u32,
    pub rows: u32,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub code: Option<String>,
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<Vec<SearchItem>>,
}

#[derive(Debug, Deserialize)]
pub struct SearchItem {
    pub adv: WireAdv,
}

#[derive(Debug, Deserialize)]
pub struct WireAdv {
    #[serde(alias = "advNo", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "f64_flex")]
    pub price: f64,
    #[serde(rename = "minTransAmount", alias = "minSingleTransAmount", default, deserialize_with = "opt_f64_flex")]
    pub min_trans_amount: Option<f64>,
    #[serde(rename = "maxTransAmount", alias = "maxSingleTransAmount", default, deserialize_with = "opt_f64_flex")]
    pub max_trans_amount: Option<f64>,
}

fn opt_f64_flex<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match opt_string_or_number(d)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s.trim().parse::<f64>().map(Some).map_err(serde::de::Error::custom),
    }
}

impl From<WireAdv> for RivalQuote {
    fn from(adv: WireAdv) -> Self {
        RivalQuote {
            id: adv.id,
            price: adv.price,
            bounds: AmountBounds {
                min: adv.min_trans_amount.unwrap_or(0.0),
                max: adv.max_trans_amount.unwrap_or(f64::MAX),
            },
        }
    }
}

impl SearchResponse {
    /// Rivals in marketplace rank order, or the classified failure.
    pub fn into_rivals(self) -> Result<Vec<RivalQuote>, ApiError> {
        match self.code.as_deref() {
            None => {}
            Some(code) if is_success_code(code) => {}
            Some(code) => return Err(ApiError::from_code(code, self.msg)),
        }
        Ok(self.data.unwrap_or_default().into_iter().map(|item| item.adv.into()).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub adv_no: String,
    pub price_floating_ratio: f64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateResponse {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub code: Option<String>,
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
}

impl UpdateResponse {
    pub fn into_result(self) -> Result<(), ApiError> {
        match self.code.as_deref() {
            Some(code) if is_success_code(code) => Ok(()),
            Some(code) => Err(ApiError::from_code(code, self.msg)),
            None => Err(ApiError::Decode("update response without code".into())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeResponse {
    #[serde(deserialize_with = "crate::wire::u64_flex")]
    pub server_time: u64,
}
