pub mod cache;
pub mod config;
pub mod engine;
pub mod market_data;
pub mod marketplace;
pub mod persist;
pub mod retry;
pub mod telemetry;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_util;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
