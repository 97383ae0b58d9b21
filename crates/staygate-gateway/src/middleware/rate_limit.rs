//! Evenly-spaced request pacing for the aggregate endpoints.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Admits at most N calls per minute, spaced `60s / N` apart.
///
/// Callers serialize through the stamp mutex and queue in arrival order; a
/// caller arriving early sleeps the remainder of the interval while holding
/// the lock. A non-positive limit falls back to 60 per minute.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn per_minute(limit: i64) -> Self {
        let limit = if limit <= 0 { 60 } else { limit as u64 };
        Self {
            interval: Duration::from_secs(60) / limit as u32,
            last: Mutex::new(None),
        }
    }

    /// Waits for the next admission slot. The first caller is admitted
    /// immediately.
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = Instant::now().saturating_duration_since(previous);
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
