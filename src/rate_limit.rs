//! Rate limiting for login and ticket issuance.
//!
//! Routes talk to a [`RateLimiter`]; the production implementation uses keyed
//! token buckets from `governor`, one bucket set per distinct limit.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use governor::{
    Quota, RateLimiter as Governor,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};

/// Per-key token bucket limiter.
type KeyedLimiter = Governor<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Throttles events per key within a sliding window.
pub trait RateLimiter: Send + Sync {
    /// Record an event for `key`. Returns true if the limit was exceeded.
    fn check(&self, key: &str, max_events: u32, window: Duration) -> bool;

    /// Seconds until `key` may try again. Zero if it is not throttled.
    fn reset_time(&self, key: &str) -> u64;

    /// Drop state for keys that are no longer throttled.
    fn prune(&self) {}
}

/// A limit applied to one kind of request.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_events: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn exceeded(&self, limiter: &dyn RateLimiter, key: &str) -> bool {
        limiter.check(key, self.max_events, self.window)
    }
}

// In test mode, limits are much higher to allow rapid test execution.

/// Login attempts per client IP.
#[cfg(not(feature = "test-mode"))]
pub const LOGIN_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_events: 5,
    window: Duration::from_secs(60),
};
#[cfg(feature = "test-mode")]
pub const LOGIN_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_events: 1000,
    window: Duration::from_secs(60),
};

/// Ticket issuance per client IP.
#[cfg(not(feature = "test-mode"))]
pub const TICKET_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_events: 30,
    window: Duration::from_secs(60),
};
#[cfg(feature = "test-mode")]
pub const TICKET_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_events: 1000,
    window: Duration::from_secs(60),
};

/// [`RateLimiter`] backed by `governor` keyed limiters.
///
/// `max_events` may be spent as a burst; the bucket then refills at
/// `max_events` per `window`.
#[derive(Default)]
pub struct GovernorRateLimiter {
    clock: DefaultClock,
    limiters: Mutex<HashMap<(u32, Duration), Arc<KeyedLimiter>>>,
    blocked_until: Mutex<HashMap<String, Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GovernorRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn limiter_for(&self, max_events: NonZeroU32, window: Duration) -> Option<Arc<KeyedLimiter>> {
        let mut limiters = lock(&self.limiters);
        if let Some(limiter) = limiters.get(&(max_events.get(), window)) {
            return Some(limiter.clone());
        }

        let quota = Quota::with_period(window / max_events.get())?.allow_burst(max_events);
        let limiter = Arc::new(Governor::new(
            quota,
            DefaultKeyedStateStore::default(),
            self.clock.clone(),
        ));
        limiters.insert((max_events.get(), window), limiter.clone());
        Some(limiter)
    }
}

impl RateLimiter for GovernorRateLimiter {
    fn check(&self, key: &str, max_events: u32, window: Duration) -> bool {
        let Some(max_events) = NonZeroU32::new(max_events) else {
            return true;
        };
        // A window too short to express as a refill period is effectively unlimited.
        let Some(limiter) = self.limiter_for(max_events, window) else {
            return false;
        };

        match limiter.check_key(&key.to_string()) {
            Ok(_) => false,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                lock(&self.blocked_until).insert(key.to_string(), Instant::now() + wait);
                true
            }
        }
    }

    fn reset_time(&self, key: &str) -> u64 {
        let mut blocked = lock(&self.blocked_until);
        let Some(until) = blocked.get(key).copied() else {
            return 0;
        };

        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            blocked.remove(key);
            return 0;
        }
        remaining.as_millis().div_ceil(1000) as u64
    }

    fn prune(&self) {
        let limiters: Vec<_> = lock(&self.limiters).values().cloned().collect();
        for limiter in limiters {
            limiter.retain_recent();
        }

        let now = Instant::now();
        lock(&self.blocked_until).retain(|_, until| *until > now);
    }
}
