use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::types::Listing;
use crate::persist::{ListingStore, PersistError, PersistResult};

/// In-process store, used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: Mutex<HashMap<String, Listing>>,
    writes: Mutex<u64>,
}

impl MemoryListingStore {
    pub fn new(listings: impl IntoIterator<Item = Listing>) -> Self {
        let rows = listings.into_iter().map(|l| (l.id.clone(), l)).collect();
        Self { rows: Mutex::new(rows), writes: Mutex::new(0) }
    }

    pub fn row(&self, id: &str) -> Option<Listing> {
        self.rows.lock().get(id).cloned()
    }

    pub fn writes(&self) -> u64 {
        *self.writes.lock()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn get_all(&self) -> PersistResult<Vec<Listing>> {
        let mut all: Vec<Listing> = self.rows.lock().values().filter(|l| l.active).cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn update_one(&self, listing: &Listing) -> PersistResult<()> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&listing.id) else {
            return Err(PersistError::NotFound(listing.id.clone()));
        };
        *row = listing.clone();
        *self.writes.lock() += 1;
        Ok(())
    }
}
