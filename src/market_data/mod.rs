// Market data module entrypoint
pub mod types;       // wire formats + normalised diff/snapshot
pub mod normaliser;  // converts strings -> ticks/lots
pub mod order_book;  // in-memory mirror of the external book
pub mod sync;        // snapshot + buffered diff reconciliation
pub mod reference;   // shared reference-price cache
pub mod feed;        // websocket/REST driver, one task per book

pub use feed::OrderBookEngine;
pub use reference::{pair_key, ReferencePriceCache, ReferencePrices};
