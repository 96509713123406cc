//! Token bucket rate limiting for dispatch and wait polling.
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket with capacity `burst`, refilling at `qps` tokens per second.
///
/// Each job owns its own limiter so concurrent jobs are independent; the wait
/// engine polls through a separate instance.
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    /// Create a limiter. A `qps` of zero or less disables limiting.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                updated: Instant::now(),
            }),
        }
    }

    /// Block until a token is available.
    ///
    /// Cancel safe: dropping the future mid-wait consumes nothing.
    pub async fn acquire(&self) {
        if self.qps <= 0.0 {
            return;
        }
        loop {
            let delay = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.updated).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
                bucket.updated = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps)
            };
            tokio::time::sleep(delay).await;
        }
    }
}
