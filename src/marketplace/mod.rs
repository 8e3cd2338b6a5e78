pub mod types;
pub mod rate_gate;
pub mod client;
pub mod scanner;
pub mod updater;

pub use client::{HttpMarketplaceClient, MarketplaceApi, RequestSigner, UnsignedRequests};
pub use rate_gate::{EndpointClass, RateGate};
pub use scanner::{CompetitorScanner, ScanError};
pub use types::{ApiError, SearchParams};
pub use updater::{QuoteUpdater, UpdateOutcome};
