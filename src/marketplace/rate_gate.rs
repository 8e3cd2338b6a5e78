use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Search,
    Update,
}

#[derive(Debug)]
struct Slot {
    last_call: Option<Instant>,
    interval: Duration,
    base: Duration,
}

/// Minimum spacing between calls per endpoint class. The lock is held while
/// waiting, so concurrent callers queue up behind each other.
#[derive(Debug)]
pub struct RateGate {
    search: Mutex<Slot>,
    update: Mutex<Slot>,
    max_interval: Duration,
}

impl RateGate {
    pub fn new(search_interval: Duration, update_interval: Duration, max_interval: Duration) -> Self {
        let slot = |base: Duration| Mutex::new(Slot { last_call: None, interval: base, base });
        Self { search: slot(search_interval), update: slot(update_interval), max_interval }
    }

    fn slot(&self, class: EndpointClass) -> &Mutex<Slot> {
        match class {
            EndpointClass::Search => &self.search,
            EndpointClass::Update => &self.update,
        }
    }

    pub async fn wait(&self, class: EndpointClass) {
        let mut slot = self.slot(class).lock().await;
        if let Some(last) = slot.last_call {
            let ready_at = last + slot.interval;
            let now = Instant::now();
            if ready_at > now {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        slot.last_call = Some(Instant::now());
    }

    /// Double the class interval after a throttling response.
    pub async fn throttled(&self, class: EndpointClass) {
        let mut slot = self.slot(class).lock().await;
        let widened = slot.interval.max(Duration::from_millis(1)).saturating_mul(2).min(self.max_interval.max(slot.base));
        if widened != slot.interval {
            warn!(?class, from_ms = slot.interval.as_millis() as u64, to_ms = widened.as_millis() as u64, "Rate gate widened");
        }
        slot.interval = widened;
    }

    /// Halve the class interval toward its configured minimum.
    pub async fn relax(&self, class: EndpointClass) {
        let mut slot = self.slot(class).lock().await;
        if slot.interval > slot.base {
            slot.interval = (slot.interval / 2).max(slot.base);
            debug!(?class, interval_ms = slot.interval.as_millis() as u64, "Rate gate relaxed");
        }
    }

    pub async fn interval(&self, class: EndpointClass) -> Duration {
        self.slot(class).lock().await.interval
    }
}
