//! Token bucket rate limiter for datagram pacing.
//!
//! Credit is granted in whole ticks: every tick boundary adds `rate * tick`
//! bytes to the budget, capped at one tick's worth (plus one send, so a single
//! large datagram can always go out). The sender keeps sending while the budget
//! is non-negative and sleeps until the next tick boundary once it runs dry.
//! There is no busy waiting.
//!
//! Credit is computed cumulatively from the start instant with integer
//! arithmetic, so rounding never drifts the long-run rate.

use std::time::Duration;
use tokio::time::{self, Instant};

/// Tick-based token bucket.
///
/// # Examples
///
/// ```
/// use rperf2::token_bucket::TokenBucket;
/// use std::time::Duration;
///
/// # async fn example() {
/// // 10 Mbit/s = 1,250,000 bytes/sec, 20 ms ticks
/// let mut bucket = TokenBucket::new(1_250_000, Duration::from_millis(20));
/// bucket.consume(1470).await;
/// # }
/// ```
pub struct TokenBucket {
    /// Target bytes per second
    pub bytes_per_sec: u64,
    tick: Duration,
    tokens: i64,
    capacity: i64,
    start: Instant,
    ticks_granted: u64,
    credit_granted: u64,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64, tick: Duration) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let per_tick = credit_for_ticks(bytes_per_sec, tick, 1) as i64;
        Self {
            bytes_per_sec,
            tick,
            tokens: per_tick,
            capacity: per_tick,
            start: Instant::now(),
            ticks_granted: 0,
            credit_granted: 0,
        }
    }

    /// Builds a bucket from a rate in bits per second.
    pub fn from_bits_per_sec(bits_per_sec: u64, tick: Duration) -> Self {
        Self::new(bits_per_sec / 8, tick)
    }

    /// Waits until the budget allows a send of `bytes`, then charges it.
    ///
    /// The charge may push the budget negative; the debt is repaid by later
    /// ticks before the next send is allowed.
    pub async fn consume(&mut self, bytes: usize) {
        self.refill(Instant::now());
        while self.tokens < 0 {
            time::sleep_until(self.next_boundary()).await;
            self.refill(Instant::now());
        }
        self.tokens -= bytes as i64;
    }

    /// Grants credit for every tick boundary passed since the last refill.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.start);
        let ticks = (elapsed.as_nanos() / self.tick.as_nanos()) as u64;
        if ticks <= self.ticks_granted {
            return;
        }
        let total = credit_for_ticks(self.bytes_per_sec, self.tick, ticks);
        let added = total - self.credit_granted;
        self.ticks_granted = ticks;
        self.credit_granted = total;

        let cap = self.capacity.max(0);
        self.tokens = (self.tokens + added as i64).min(cap);
    }

    fn next_boundary(&self) -> Instant {
        self.start + self.tick * (self.ticks_granted as u32 + 1)
    }
}

fn credit_for_ticks(bytes_per_sec: u64, tick: Duration, ticks: u64) -> u64 {
    (bytes_per_sec as u128 * tick.as_nanos() * ticks as u128 / 1_000_000_000) as u64
}

/// Send pacing policy of a traffic generator.
pub enum Pacer {
    Unbounded,
    Limited(TokenBucket),
}

impl Pacer {
    /// Builds a pacer from an optional rate in bits per second.
    pub fn new(bits_per_sec: Option<u64>, tick: Duration) -> Self {
        match bits_per_sec {
            Some(rate) => Pacer::Limited(TokenBucket::from_bits_per_sec(rate, tick)),
            None => Pacer::Unbounded,
        }
    }

    pub async fn acquire(&mut self, bytes: usize) {
        if let Pacer::Limited(bucket) = self {
            bucket.consume(bytes).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_per_tick() {
        // 1 MB/s at 10 ms ticks = 10,000 bytes per tick
        assert_eq!(credit_for_ticks(1_000_000, Duration::from_millis(10), 1), 10_000);
        // fractional credit accumulates instead of rounding per tick
        assert_eq!(credit_for_ticks(125, Duration::from_millis(20), 1), 2);
        assert_eq!(credit_for_ticks(125, Duration::from_millis(20), 10), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_budget_is_one_tick() {
        let mut bucket = TokenBucket::new(1_000_000, Duration::from_millis(10));
        assert_eq!(bucket.tokens, 10_000);

        bucket.consume(1500).await;
        assert_eq!(bucket.tokens, 8_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_to_next_tick_when_exhausted() {
        let mut bucket = TokenBucket::new(1_000_000, Duration::from_millis(10));
        let start = Instant::now();

        // first tick's budget goes out immediately, then debt
        bucket.consume(10_000).await;
        bucket.consume(1_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // budget is now -1000: the next send waits for the first boundary
        bucket.consume(1_000).await;
        assert_eq!(start.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_run_rate() {
        // 1 MB/s for 200 KB in 1000-byte sends takes ~190-200 ms of paused time
        let mut bucket = TokenBucket::new(1_000_000, Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..200 {
            bucket.consume(1_000).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(160), "too fast: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(200), "too slow: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_does_not_bank_credit() {
        let mut bucket = TokenBucket::new(1_000_000, Duration::from_millis(10));
        time::sleep(Duration::from_secs(1)).await;
        bucket.refill(Instant::now());
        assert_eq!(bucket.tokens, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_pacer_never_waits() {
        let mut pacer = Pacer::new(None, Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..1000 {
            pacer.acquire(65_000).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slowest_rate_still_earns_credit() {
        // 8 bit/s is one byte per second: a 24-byte send needs 24 s of credit
        let mut pacer = Pacer::new(Some(8), Duration::from_millis(20));
        let start = Instant::now();
        pacer.acquire(24).await;
        pacer.acquire(24).await;
        pacer.acquire(24).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(24), "too fast: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(49), "too slow: {:?}", elapsed);
    }
}
