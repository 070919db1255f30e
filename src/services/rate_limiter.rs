use crate::constants::rate_limit::{MAX_WAIT_MS, MIN_WAIT_MS};
use crate::errors::ToolError;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.refill_rate <= 0.0 || !self.refill_rate.is_finite() {
            return;
        }
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn next_token_in(&self) -> Duration {
        let floor = Duration::from_millis(MIN_WAIT_MS);
        if self.refill_rate <= 0.0 || !self.refill_rate.is_finite() {
            return floor.max(Duration::from_millis(100));
        }
        let ceiling = Duration::from_millis(MAX_WAIT_MS);
        let secs = ((1.0 - self.tokens) / self.refill_rate).max(0.0);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(ceiling)
            .clamp(floor, ceiling)
    }
}

/// Token bucket. Starts full; `allow` never blocks, `wait` sleeps until a token
/// is available or the caller cancels.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let max_tokens = f64::from(burst);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                max_tokens,
                refill_rate: rate_per_sec.max(0.0),
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn allow(&self) -> bool {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.try_take()
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ToolError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ToolError::cancelled("Rate limiter wait cancelled by caller"));
            }
            let delay = {
                let mut bucket = self.lock();
                bucket.refill(Instant::now());
                if bucket.try_take() {
                    return Ok(());
                }
                bucket.next_token_in()
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ToolError::cancelled("Rate limiter wait cancelled by caller"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    pub fn tokens(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    pub fn set_rate(&self, rate_per_sec: f64) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.refill_rate = rate_per_sec.max(0.0);
    }

    pub fn set_burst(&self, burst: u32) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.max_tokens = f64::from(burst);
        if bucket.tokens > bucket.max_tokens {
            bucket.tokens = bucket.max_tokens;
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        serde_json::json!({
            "tokens": bucket.tokens,
            "max_tokens": bucket.max_tokens,
            "refill_rate": bucket.refill_rate,
        })
    }
}
