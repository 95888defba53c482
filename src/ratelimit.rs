use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Token bucket gating tail retries: `burst` immediate attempts, then one
/// token back per `period`. Each supervising task owns its own limiter, so a
/// crash-looping container throttles only itself.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    burst: u32,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(period: Duration, burst: u32) -> Self {
        Self {
            period,
            burst,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    /// Waits for a token. Returns false when cancelled while waiting.
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> bool {
        self.refill();
        if self.tokens < 1.0 {
            let deficit = 1.0 - self.tokens;
            let wait = self.period.mul_f64(deficit);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
            self.refill();
        }
        self.tokens -= 1.0;
        true
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        let replenished = elapsed.as_secs_f64() / self.period.as_secs_f64();
        self.tokens = (self.tokens + replenished).min(self.burst as f64);
    }
}
