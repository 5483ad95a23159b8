// Token buckets gating calls to the external accounting command.
//
// One bucket per cluster, capacity = calls per minute, refilled continuously
// at capacity/60 tokens per wall-clock second and clamped to capacity.  The
// bucket is the only admission point for sacct invocations in this process;
// cross-process serialization comes from the per-cluster state lock.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_min: f64) -> TokenBucket {
        TokenBucket {
            capacity: rate_per_min,
            tokens: rate_per_min,
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.capacity / 60.0).min(self.capacity);
            self.last = now;
        }
    }

    /// Take one token, sleeping as long as it takes for one to accrue.

    pub fn acquire(&mut self, cluster: &str) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let wait = deficit_sleep(self.tokens, self.capacity);
            debug!(cluster, phase = "rate_wait", sleep = wait.as_secs_f64());
            thread::sleep(wait);
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens
    }
}

// Time until the next whole token: (1 - tokens) * 60 / capacity seconds.
fn deficit_sleep(tokens: f64, capacity: f64) -> Duration {
    Duration::from_secs_f64((1.0 - tokens) * 60.0 / capacity)
}

/// The per-cluster bucket registry, owned by the CLI layer for the lifetime
/// of the process and threaded into the adapter.

pub struct Limits {
    rate_per_min: f64,
    buckets: HashMap<String, TokenBucket>,
}

impl Limits {
    pub fn new(rate_per_min: f64) -> Limits {
        Limits {
            rate_per_min,
            buckets: HashMap::new(),
        }
    }

    pub fn bucket(&mut self, cluster: &str) -> &mut TokenBucket {
        self.buckets
            .entry(cluster.to_string())
            .or_insert_with(|| TokenBucket::new(self.rate_per_min))
    }
}

#[test]
fn test_acquire_without_wait() {
    // A generous bucket never sleeps for the first `capacity` calls.
    let mut b = TokenBucket::new(600.0);
    let before = Instant::now();
    for _ in 0..5 {
        b.acquire("c1");
    }
    assert!(before.elapsed() < Duration::from_millis(100));
    assert!(b.tokens() <= 595.0 + 1.0);
}

#[test]
fn test_deficit_sleep() {
    // Empty bucket at 2/min: a full token is 30s away.
    assert_eq!(deficit_sleep(0.0, 2.0), Duration::from_secs(30));
    // Half a token deficit at 60/min: 0.5s.
    assert_eq!(deficit_sleep(0.5, 60.0), Duration::from_secs_f64(0.5));
}

#[test]
fn test_registry_is_per_cluster() {
    let mut limits = Limits::new(600.0);
    limits.bucket("a").acquire("a");
    limits.bucket("a").acquire("a");
    limits.bucket("b").acquire("b");
    assert!(limits.bucket("a").tokens() < limits.bucket("b").tokens());
}
