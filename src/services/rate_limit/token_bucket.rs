use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Window over which recent admissions are reported
const RECENT_WINDOW: Duration = Duration::from_secs(60);

/// Sustained rate and burst capacity of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub rate_per_sec: f64,
    pub burst: u32,
}

impl BucketConfig {
    pub const fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    recent: VecDeque<Instant>,
}

impl BucketState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) >= RECENT_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub name: String,
    pub rate_per_sec: f64,
    pub burst: u32,
    pub tokens: f64,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub requests_last_minute: usize,
    /// Admissions in the last minute relative to the sustained rate
    pub utilization: f64,
}

/// Classic token bucket refilled continuously at `rate_per_sec`
///
/// Tokens always stay within `[0, burst]`. The bucket starts full.
pub struct TokenBucket {
    name: String,
    config: BucketConfig,
    state: Mutex<BucketState>,
    total_requests: AtomicU64,
    rejected_requests: AtomicU64,
}

impl TokenBucket {
    pub fn new(name: impl Into<String>, config: BucketConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
                recent: VecDeque::new(),
            }),
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BucketConfig {
        self.config
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.rate_per_sec)
            .clamp(0.0, self.config.burst as f64);
        state.last_refill = now;
    }

    /// Takes one token if available
    ///
    /// On failure returns how long until the next token is expected.
    pub fn try_take(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.recent.push_back(now);
            state.prune(now);
            return Ok(());
        }

        if self.config.rate_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(missing / self.config.rate_per_sec))
    }

    /// Returns a token taken by a caller that then failed to pass a later gate
    pub fn give_back(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.tokens = (state.tokens + 1.0).min(self.config.burst as f64);
        state.recent.pop_back();
    }

    pub fn record(&self, granted: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !granted {
            self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BucketStats {
        let now = Instant::now();
        let (tokens, recent) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.refill(&mut state, now);
            state.prune(now);
            (state.tokens, state.recent.len())
        };

        let capacity_per_minute = self.config.rate_per_sec * RECENT_WINDOW.as_secs_f64();
        BucketStats {
            name: self.name.clone(),
            rate_per_sec: self.config.rate_per_sec,
            burst: self.config.burst,
            tokens,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            requests_last_minute: recent,
            utilization: if capacity_per_minute > 0.0 {
                recent as f64 / capacity_per_minute
            } else {
                0.0
            },
        }
    }
}
