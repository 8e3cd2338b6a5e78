pub mod types;
pub use types::*;
pub mod memory;
pub mod postgres;
use async_trait::async_trait;

use crate::engine::types::Listing;

/// Storage collaborator for the operator's listings. The pricing engine only
/// ever reads everything at startup and overwrites single rows afterwards.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn get_all(&self) -> PersistResult<Vec<Listing>>;
    async fn update_one(&self, listing: &Listing) -> PersistResult<()>;
}
