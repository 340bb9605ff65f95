use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Result, ScanError};

/// Rate limiter using token bucket algorithm
///
/// Holds at most `burst` tokens and gains one every `frequency`. Callers
/// wait for a token rather than being rejected.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    frequency: Duration,
    burst: usize,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(frequency: Duration, burst: usize) -> Self {
        let burst = burst.max(1);
        Self {
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            frequency,
            burst,
        }
    }

    /// Take one token without waiting.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - state.tokens;
        Err(self.frequency.mul_f64(missing).max(Duration::from_millis(1)))
    }

    /// Wait until a token is available or the scan is canceled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Canceled);
            }

            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.frequency.is_zero() {
            state.tokens = self.burst as f64;
            state.last_refill = now;
            return;
        }

        let elapsed = now.duration_since(state.last_refill);
        let gained = elapsed.as_secs_f64() / self.frequency.as_secs_f64();
        if gained > 0.0 {
            state.tokens = (state.tokens + gained).min(self.burst as f64);
            state.last_refill = now;
        }
    }
}

/// Per-host limiter table, created on first use and shared afterwards.
#[derive(Debug)]
pub struct HostLimiters {
    limiters: Mutex<HashMap<String, Arc<TokenBucket>>>,
    frequency: Duration,
    burst: usize,
}

impl HostLimiters {
    pub fn new(frequency: Duration, burst: usize) -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
            frequency,
            burst,
        }
    }

    pub fn limiter_for(&self, host: &str) -> Arc<TokenBucket> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(host.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.frequency, self.burst)))
            .clone()
    }

    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> Result<()> {
        let limiter = self.limiter_for(host);
        limiter.acquire(cancel).await
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
