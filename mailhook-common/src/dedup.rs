//! # Dedup
//!
//! Suppress reprocessing of the same message within a time window.
//!
//! The provider routinely sends several notifications for one message (a `created` followed by one
//! or more `updated`, or redeliveries after a slow acknowledgement). Consumers must be idempotent
//! anyway, so a duplicate slipping through is tolerable; suppressing a message that was never
//! seen is not, which is why keys must carry the full message identity.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

/// Default time a key is remembered for.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Source of the current time, injected so tests can move it by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A key to first-seen map with a fixed time to live.
///
/// Expired entries are dropped when their key is looked up again, and in bulk by
/// `evict_expired`, which the service calls on an interval so that keys that never come back do
/// not accumulate.
pub struct Deduplicator {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Deduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return true the first time `key` is seen within the window, and record it.
    /// Later calls for the same key return false until the entry expires.
    pub fn should_process(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut seen = self.lock();

        match seen.get(key) {
            Some(first_seen) if now.duration_since(*first_seen) < self.ttl => false,
            _ => {
                seen.insert(key.to_owned(), now);
                true
            }
        }
    }

    /// Drop every entry older than the TTL, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut seen = self.lock();

        let before = seen.len();
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.ttl);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => {
                // The map only ever holds timestamps, so a panic elsewhere cannot leave it
                // half-updated.
                warn!("recovering poisoned deduplicator mutex");
                poisoned.into_inner()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
