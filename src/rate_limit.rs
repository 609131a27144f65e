use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// One token bucket per upstream host with continuous refill.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Earliest instant the next grant may be handed out, driven by 429
    /// responses and reset headers from the upstream.
    not_before: Option<Instant>,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Bucket {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
            not_before: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Reserve one token and return how long the caller must wait before the
    /// grant is effective. Tokens may go transiently negative: a negative
    /// balance encodes the queue of reservations already handed out, which
    /// keeps grants FIFO without holding the lock across the sleep.
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;

        let token_wait = if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_per_sec)
        };

        let backoff_wait = match self.not_before {
            Some(t) if t > now => t.duration_since(now),
            _ => {
                self.not_before = None;
                Duration::ZERO
            }
        };

        token_wait.max(backoff_wait)
    }
}

/// Process-wide token-bucket limiter keyed by upstream host.
///
/// `acquire` blocks cooperatively until a grant is available; `observe`
/// feeds response status and rate-limit headers back into the bucket.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
            capacity: config.capacity.max(1.0),
            refill_per_sec: config.refill_per_sec.max(0.001),
        }
    }

    /// Wait for a grant on `host`. Returns the time actually waited.
    pub async fn acquire(&self, host: &str) -> Duration {
        let wait = {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets
                .entry(host.to_string())
                .or_insert_with(|| Bucket::new(self.capacity, self.refill_per_sec));
            bucket.reserve(Instant::now())
        };

        if !wait.is_zero() {
            log::debug!(
                "rate_limit wait host={} wait_ms={}",
                host,
                wait.as_millis()
            );
            sleep(wait).await;
        }
        wait
    }

    /// Feed a response back. A 429 or an explicit reset header clamps the
    /// bucket to zero and defers every queued acquisition past the reset
    /// instant. 5xx responses leave the bucket unchanged (the HTTP client
    /// owns that retry).
    pub async fn observe(&self, host: &str, status: u16, retry_after_secs: Option<u64>) {
        if status != 429 && retry_after_secs.is_none() {
            return;
        }

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(host.to_string())
            .or_insert_with(|| Bucket::new(self.capacity, self.refill_per_sec));

        let now = Instant::now();
        bucket.refill(now);
        bucket.tokens = bucket.tokens.min(0.0);

        let defer = Duration::from_secs(retry_after_secs.unwrap_or(1));
        let until = now + defer;
        bucket.not_before = Some(match bucket.not_before {
            Some(existing) if existing > until => existing,
            _ => until,
        });

        log::warn!(
            "rate_limit backoff host={} status={} defer_secs={}",
            host,
            status,
            defer.as_secs()
        );
    }

    /// Current token balance for a host, for health reporting.
    pub async fn tokens(&self, host: &str) -> Option<f64> {
        let mut buckets = self.buckets.lock().await;
        buckets.get_mut(host).map(|b| {
            b.refill(Instant::now());
            b.tokens
        })
    }
}
