//! Token-bucket bandwidth limiter (C2).
//!
//! A classic token bucket: tokens refill continuously at `rate` bytes/sec up
//! to `capacity` bytes of burst, and `consume(n)` blocks the calling thread
//! until `n` tokens are available. Segment workers call this between reads,
//! the same place they'd check a cancellation flag.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct BucketState {
    rate_bps: u64,
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket. Construct one for the global limiter and, if
/// configured, one per task; chain them with `LimiterChain`.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate_bps == 0` disables limiting: `consume` becomes a no-op.
    /// Burst capacity defaults to one second of `rate_bps`.
    pub fn new(rate_bps: u64) -> Self {
        Self::with_capacity(rate_bps, rate_bps.max(1))
    }

    pub fn with_capacity(rate_bps: u64, capacity: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate_bps,
                capacity,
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Disabled bucket: every `consume` returns immediately.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.state.lock().unwrap().rate_bps == 0
    }

    /// Atomically reconfigure the rate and burst capacity. Takes effect on
    /// the next `consume` call.
    pub fn reconfigure(&self, rate_bps: u64, capacity: u64) {
        let mut s = self.state.lock().unwrap();
        s.rate_bps = rate_bps;
        s.capacity = capacity;
        s.tokens = s.tokens.min(capacity as f64);
    }

    /// Block the calling thread until `n` bytes' worth of tokens are
    /// available, then consume them. No-op when the bucket is unlimited.
    pub fn consume(&self, n: u64) {
        loop {
            let wait = {
                let mut s = self.state.lock().unwrap();
                if s.rate_bps == 0 {
                    return;
                }
                refill(&mut s);
                if s.tokens >= n as f64 {
                    s.tokens -= n as f64;
                    return;
                }
                let deficit = n as f64 - s.tokens;
                Duration::from_secs_f64(deficit / s.rate_bps as f64)
            };
            std::thread::sleep(wait);
        }
    }
}

fn refill(s: &mut BucketState) {
    let now = Instant::now();
    let elapsed = now.duration_since(s.last_refill).as_secs_f64();
    s.last_refill = now;
    if elapsed <= 0.0 {
        return;
    }
    s.tokens = (s.tokens + elapsed * s.rate_bps as f64).min(s.capacity as f64);
}

/// Global-then-per-task limiter chain: a transfer must pass both in
/// sequence. Either side may be absent, in which case it's skipped.
pub struct LimiterChain {
    pub global: Option<std::sync::Arc<TokenBucket>>,
    pub per_task: Option<TokenBucket>,
}

impl LimiterChain {
    pub fn none() -> Self {
        Self {
            global: None,
            per_task: None,
        }
    }

    pub fn consume(&self, n: u64) {
        if let Some(g) = &self.global {
            g.consume(n);
        }
        if let Some(t) = &self.per_task {
            t.consume(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_bucket_never_blocks() {
        let b = TokenBucket::unlimited();
        let start = Instant::now();
        b.consume(1_000_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn burst_is_consumed_immediately() {
        let b = TokenBucket::new(1000);
        let start = Instant::now();
        b.consume(1000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn exceeding_burst_blocks_roughly_the_expected_duration() {
        let b = TokenBucket::with_capacity(1000, 1000);
        b.consume(1000); // drain the burst
        let start = Instant::now();
        b.consume(500); // must wait ~0.5s for refill
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed <= Duration::from_millis(800));
    }

    #[test]
    fn reconfigure_takes_effect_on_next_consume() {
        let b = TokenBucket::new(10);
        b.reconfigure(0, 0);
        let start = Instant::now();
        b.consume(1_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn chain_with_no_limiters_is_a_no_op() {
        let chain = LimiterChain::none();
        let start = Instant::now();
        chain.consume(1_000_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn chain_consumes_from_both_sides() {
        let chain = LimiterChain {
            global: Some(std::sync::Arc::new(TokenBucket::new(1_000_000))),
            per_task: Some(TokenBucket::new(1_000_000)),
        };
        chain.consume(1000);
        // Both sides should have been debited; verify via a direct bucket check.
        if let Some(g) = &chain.global {
            assert!(g.state.lock().unwrap().tokens < 1_000_000.0);
        }
    }
}
