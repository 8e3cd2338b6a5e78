use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::WriteThrough;
use crate::engine::types::Listing;
use crate::persist::{ListingStore, PersistError, PersistResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    pub evicted: usize,
}

/// In-memory listings over the storage collaborator. Mutations mark the
/// listing dirty; `flush` writes every dirty listing once.
pub struct ListingRegistry {
    listings: WriteThrough<String, Listing>,
    store: Arc<dyn ListingStore>,
}

impl ListingRegistry {
    pub async fn load(store: Arc<dyn ListingStore>) -> PersistResult<Self> {
        let rows = store.get_all().await?;
        let listings = WriteThrough::new();
        listings.load(rows.into_iter().map(|l| {
            let l = l.with_group_key();
            (l.id.clone(), l)
        }));
        info!(count = listings.len(), "Listing registry loaded");
        Ok(Self { listings, store })
    }

    pub fn get(&self, id: &str) -> Option<Listing> {
        self.listings.get(&id.to_string())
    }

    pub fn active(&self) -> Vec<Listing> {
        let mut active: Vec<Listing> = self.listings.values().into_iter().filter(|l| l.active).collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Every id the operator owns, active or not; used to drop our own
    /// listings from rival scans.
    pub fn owned_ids(&self) -> HashSet<String> {
        self.listings.keys().into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn record_update(&self, id: &str, ratio: f64, price: f64, at_ms: i64) -> bool {
        self.listings.update(&id.to_string(), |l| {
            l.ratio = ratio;
            l.price = price;
            l.updated_at_ms = at_ms;
        })
    }

    pub fn mark_inactive(&self, id: &str, at_ms: i64) -> bool {
        self.listings.update(&id.to_string(), |l| {
            l.active = false;
            l.updated_at_ms = at_ms;
        })
    }

    /// Write dirty listings to the store. Failed writes stay dirty for the
    /// next flush; inactive listings leave memory once written.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for (id, listing) in self.listings.take_dirty() {
            match self.store.update_one(&listing).await {
                Ok(()) => {
                    report.written += 1;
                    if !listing.active {
                        self.listings.remove(&id);
                        report.evicted += 1;
                        info!(id = %id, "Delisted listing removed from registry");
                    }
                }
                Err(PersistError::NotFound(_)) => {
                    warn!(id = %id, "Listing missing from store, dropping it");
                    self.listings.remove(&id);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Listing flush failed, will retry");
                    self.listings.mark_dirty(id);
                    report.failed += 1;
                }
            }
        }
        if report != FlushReport::default() {
            debug!(?report, "Registry flushed");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{AmountBounds, PaymentMethod, Side};
    use crate::persist::memory::MemoryListingStore;
    use async_trait::async_trait;

    fn listing(id: &str) -> Listing {
        Listing {
            id: id.into(),
            side: Side::BUY,
            asset: "USDT".into(),
            fiat: "MXN".into(),
            price: 18.0,
            ratio: 100.0,
            target_rank: 1,
            bounds: AmountBounds { min: 500.0, max: 10_000.0 },
            payment_methods: vec![PaymentMethod::BankTransfer],
            group_key: String::new(),
            active: true,
            updated_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_load_update_flush() {
        let store = Arc::new(MemoryListingStore::new([listing("a"), listing("b")]));
        let registry = ListingRegistry::load(store.clone()).await.unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.get("a").unwrap().group_key.is_empty());

        assert!(registry.record_update("a", 99.5, 17.91, 42));
        assert!(!registry.record_update("zzz", 1.0, 1.0, 1));
        let report = registry.flush().await;
        assert_eq!(report, FlushReport { written: 1, failed: 0, evicted: 0 });
        assert_eq!(store.row("a").unwrap().ratio, 99.5);
        assert_eq!(store.row("b").unwrap().ratio, 100.0);

        // nothing dirty, nothing written
        assert_eq!(registry.flush().await, FlushReport::default());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_inactive_is_flushed_then_evicted() {
        let store = Arc::new(MemoryListingStore::new([listing("a"), listing("b")]));
        let registry = ListingRegistry::load(store.clone()).await.unwrap();
        registry.mark_inactive("a", 7);
        assert_eq!(registry.active().len(), 1);
        let report = registry.flush().await;
        assert_eq!(report.evicted, 1);
        assert!(registry.get("a").is_none());
        assert!(!store.row("a").unwrap().active);
    }

    struct FailingStore;

    #[async_trait]
    impl ListingStore for FailingStore {
        async fn get_all(&self) -> PersistResult<Vec<Listing>> {
            Ok(vec![listing("a")])
        }
        async fn update_one(&self, _listing: &Listing) -> PersistResult<()> {
            Err(PersistError::Io("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_write_stays_dirty() {
        let registry = ListingRegistry::load(Arc::new(FailingStore)).await.unwrap();
        registry.record_update("a", 101.0, 18.18, 1);
        assert_eq!(registry.flush().await.failed, 1);
        assert_eq!(registry.flush().await.failed, 1);
        assert_eq!(registry.get("a").unwrap().ratio, 101.0);
    }
}
