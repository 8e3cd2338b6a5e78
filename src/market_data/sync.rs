//! Snapshot/diff reconciliation for one connection attempt.
//!
//! Diffs that arrive before the REST snapshot are buffered. When the snapshot
//! lands, buffered diffs newer than it are replayed in sequence order and the
//! book goes live. A reconnect starts from a fresh `BookSync`.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::market_data::order_book::OrderBook;
use crate::market_data::types::{BookSnapshot, DiffMessage, FeedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Buffered,
    Applied,
    Stale,
}

#[derive(Debug)]
pub struct BookSync {
    book: OrderBook,
    pending: VecDeque<DiffMessage>,
    synced: bool,
    max_buffered: usize,
}

impl BookSync {
    pub fn new(max_buffered: usize) -> Self {
        Self { book: OrderBook::new(), pending: VecDeque::new(), synced: false, max_buffered: max_buffered.max(1) }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// A full pre-snapshot buffer is a gap: the attempt has to start over
    /// from a new snapshot rather than lose a diff.
    pub fn on_diff(&mut self, diff: DiffMessage) -> Result<SyncOutcome, FeedError> {
        if !self.synced {
            if self.pending.len() >= self.max_buffered {
                warn!(sequence = diff.sequence, cap = self.max_buffered, "Pre-snapshot buffer full");
                return Err(FeedError::Gap { sequence: diff.sequence, buffered: self.pending.len() });
            }
            self.pending.push_back(diff);
            return Ok(SyncOutcome::Buffered);
        }
        if self.book.apply_diff(&diff) {
            Ok(SyncOutcome::Applied)
        } else {
            Ok(SyncOutcome::Stale)
        }
    }

    /// Load the snapshot and replay buffered diffs newer than it. Returns the
    /// number of diffs replayed.
    pub fn on_snapshot(&mut self, snapshot: BookSnapshot) -> usize {
        self.book = OrderBook::new();
        self.book.load_snapshot(&snapshot);

        let mut pending: Vec<DiffMessage> = self.pending.drain(..).collect();
        pending.sort_by_key(|d| d.sequence);
        let buffered = pending.len();
        let replayed = pending
            .iter()
            .filter(|d| d.sequence > snapshot.sequence)
            .filter(|d| self.book.apply_diff(d))
            .count();

        self.synced = true;
        debug!(snapshot_sequence = snapshot.sequence, buffered, replayed, "Book synchronised");
        replayed
    }
}
