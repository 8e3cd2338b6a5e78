// Wire formats for the diff-orders stream and the REST order book snapshot,
// plus their normalised (integer ticks/lots) forms.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::market_data::normaliser::Normaliser;
use crate::wire;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("websocket transport error: {0}")]
    Transport(String),
    #[error("snapshot request failed: {0}")]
    Snapshot(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("stream closed by remote")]
    Closed,
    #[error("no message received for {0:?}")]
    Idle(Duration),
    #[error("{buffered} diffs buffered before the snapshot, sequence {sequence} would be lost")]
    Gap { sequence: u64, buffered: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    fn from_wire(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => match n.as_u64()? {
                0 => Some(BookSide::Bid),
                1 => Some(BookSide::Ask),
                _ => None,
            },
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "0" | "buy" | "bid" => Some(BookSide::Bid),
                "1" | "sell" | "ask" => Some(BookSide::Ask),
                _ => None,
            },
            _ => None,
        }
    }
}

// ---- stream ----

/// Every frame on the socket: diffs, keep-alives and subscription acks.
#[derive(Debug, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub book: String,
    #[serde(default, deserialize_with = "wire::opt_u64_flex")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct WsDiffEntry {
    #[serde(alias = "r", deserialize_with = "wire::string_or_number")]
    pub price: String,
    #[serde(alias = "a", default, deserialize_with = "wire::opt_string_or_number")]
    pub amount: Option<String>,
    #[serde(alias = "t")]
    pub side: Value,
    #[serde(alias = "s", default)]
    pub status: Option<String>,
}

impl WsDiffEntry {
    /// Remaining size at this price. This is the single removal rule: a
    /// missing amount, a zero amount, or any status other than `open` all
    /// come out as zero, and a zero remaining size deletes the level.
    pub fn remaining(&self, norm: &Normaliser) -> Result<u64, FeedError> {
        if let Some(status) = &self.status {
            if !status.eq_ignore_ascii_case("open") {
                return Ok(0);
            }
        }
        match &self.amount {
            None => Ok(0),
            Some(a) => norm.size_to_lots(a),
        }
    }

    pub fn normalise(&self, norm: &Normaliser) -> Result<DiffEntry, FeedError> {
        let side = BookSide::from_wire(&self.side)
            .ok_or_else(|| FeedError::Malformed(format!("unknown side {}", self.side)))?;
        Ok(DiffEntry { side, price: norm.price_to_ticks(&self.price)?, remaining: self.remaining(norm)? })
    }
}

// ---- REST snapshot ----

#[derive(Debug, Deserialize)]
pub struct RestSnapshotResponse {
    #[serde(default)]
    pub success: bool,
    pub payload: Option<RestSnapshotPayload>,
}

#[derive(Debug, Deserialize)]
pub struct RestSnapshotPayload {
    #[serde(deserialize_with = "wire::u64_flex")]
    pub sequence: u64,
    #[serde(default)]
    pub bids: Vec<RestLevel>,
    #[serde(default)]
    pub asks: Vec<RestLevel>,
}

#[derive(Debug, Deserialize)]
pub struct RestLevel {
    #[serde(deserialize_with = "wire::string_or_number")]
    pub price: String,
    #[serde(deserialize_with = "wire::string_or_number")]
    pub amount: String,
}

impl RestSnapshotPayload {
    pub fn normalise(&self, norm: &Normaliser) -> Result<BookSnapshot, FeedError> {
        let side = |levels: &[RestLevel]| -> Result<Vec<(i64, u64)>, FeedError> {
            levels
                .iter()
                .map(|l| Ok((norm.price_to_ticks(&l.price)?, norm.size_to_lots(&l.amount)?)))
                .collect()
        };
        Ok(BookSnapshot { sequence: self.sequence, bids: side(&self.bids)?, asks: side(&self.asks)? })
    }
}

// ---- normalised ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffEntry {
    pub side: BookSide,
    pub price: i64,     // ticks
    pub remaining: u64, // lots; 0 removes the level
}

impl DiffEntry {
    pub fn is_removal(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffMessage {
    pub sequence: u64,
    pub entries: Vec<DiffEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSnapshot {
    pub sequence: u64,
    pub bids: Vec<(i64, u64)>, // (price_ticks, size_lots)
    pub asks: Vec<(i64, u64)>,
}

/// Decode one text frame. `Ok(None)` for control frames (keep-alives,
/// subscription acks, other channels or books).
pub fn parse_frame(text: &str, book: &str, norm: &Normaliser) -> Result<Option<DiffMessage>, FeedError> {
    let msg: WsMessage = serde_json::from_str(text).map_err(|e| FeedError::Malformed(e.to_string()))?;
    if msg.kind != "diff-orders" || !msg.payload.is_array() {
        return Ok(None);
    }
    if !msg.book.is_empty() && msg.book != book {
        return Ok(None);
    }
    let sequence = msg
        .sequence
        .ok_or_else(|| FeedError::Malformed("diff without sequence".into()))?;
    let raw: Vec<WsDiffEntry> =
        serde_json::from_value(msg.payload).map_err(|e| FeedError::Malformed(e.to_string()))?;
    let entries = raw.iter().map(|e| e.normalise(norm)).collect::<Result<Vec<_>, _>>()?;
    Ok(Some(DiffMessage { sequence, entries }))
}
