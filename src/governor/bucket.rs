//! A single group's token bucket: peak-per-interval, non-accumulating.
//!
//! Mirrors the guard-then-sleep shape of `RateLimiter::acquire` — check
//! under the lock, compute how long to sleep, drop the lock, sleep, loop —
//! rather than a background ticker task per group.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::sync_support::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketSnapshot {
    pub capacity: u64,
    pub available: u64,
    pub interval: Duration,
}

#[derive(Debug)]
struct BucketState {
    capacity: u64,
    interval: Duration,
    available: u64,
    last_replenish: Instant,
}

impl BucketState {
    fn replenish_if_due(&mut self) {
        if self.last_replenish.elapsed() >= self.interval {
            self.available = self.capacity;
            self.last_replenish = Instant::now();
        }
    }

    fn time_until_replenish(&self) -> Duration {
        self.interval.saturating_sub(self.last_replenish.elapsed())
    }
}

/// A non-accumulating token bucket. `Available` resets to `Capacity` on
/// each interval boundary rather than rolling unused tokens forward.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(capacity: u64, interval: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState {
                capacity,
                interval,
                available: capacity,
                last_replenish: Instant::now(),
            }),
        }
    }

    /// Grants up to `requested` bytes, possibly fewer if `Available` is
    /// partially depleted, 0 if `requested` is 0 or `cancel` fires before a
    /// grant can be made. Waits at most one `Interval` per retry.
    pub async fn acquire(&self, requested: u64, cancel: &CancellationToken) -> u64 {
        if requested == 0 {
            return 0;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.replenish_if_due();
                if state.available > 0 {
                    let grant = requested.min(state.available);
                    state.available -= grant;
                    return grant;
                }
                state.time_until_replenish()
            };
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return 0,
            }
        }
    }

    /// Gives back unused bytes from a prior grant, clamped to `Capacity`.
    /// A zero-byte return is a harmless no-op.
    pub async fn give_back(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock().await;
        state.available = (state.available + bytes).min(state.capacity);
    }

    /// Updates capacity/interval in place. In-flight `acquire` callers
    /// observe the new values on their next loop iteration; none are ever
    /// dropped.
    pub async fn resize(&self, capacity: u64, interval: Duration) {
        let mut state = self.state.lock().await;
        state.capacity = capacity;
        state.interval = interval;
        state.available = state.available.min(capacity);
    }

    pub async fn snapshot(&self) -> TokenBucketSnapshot {
        let state = self.state.lock().await;
        TokenBucketSnapshot {
            capacity: state.capacity,
            available: state.available,
            interval: state.interval,
        }
    }
}
