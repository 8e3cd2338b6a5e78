//! Retry policy shared by feed reconnects, rival searches and quote updates.
//!
//! Delays grow exponentially from `base` and stop growing at `cap`, so a long
//! outage settles into a fixed retry cadence. `max_attempts = None` retries
//! forever (feed reconnects); REST calls use a bounded attempt count.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total number of calls allowed, including the first. `None` = unlimited.
    pub max_attempts: Option<u32>,
    /// Extra random delay as a fraction of the backoff (0.0 disables jitter).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: Option<u32>) -> Self {
        Self { base, cap, max_attempts, jitter: 0.0 }
    }

    pub fn unlimited(base: Duration, cap: Duration) -> Self {
        Self::new(base, cap, None)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Backoff before retry number `attempt` (0 = first retry), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        backoff + backoff.mul_f64(extra)
    }

    /// Whether call number `attempt` (0-based) may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. `op` receives the 0-based attempt number.
    pub async fn retry<T, E, F, Fut>(&self, op_name: &str, mut op: F, is_transient: fn(&E) -> bool) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(op = op_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_transient(&e) && self.allows(attempt + 1) => {
                    let delay = self.delay(attempt);
                    warn!(op = op_name, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
