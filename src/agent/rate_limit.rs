//! Minimum spacing between successive LLM requests

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default minimum interval between LLM calls within a request loop
pub const DEFAULT_MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(500);

/// Sleeps the shortfall so consecutive LLM calls stay at least
/// `min_interval` apart
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait out any remaining interval, then stamp this request
    pub async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_REQUEST_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_does_not_wait() {
        let pacer = RequestPacer::new(Duration::from_millis(500));
        let before = Instant::now();
        pacer.pace().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_calls_are_spaced() {
        let pacer = RequestPacer::new(Duration::from_millis(500));
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_interval_skips_sleep() {
        let pacer = RequestPacer::new(Duration::from_millis(500));
        pacer.pace().await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        let before = Instant::now();
        pacer.pace().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
