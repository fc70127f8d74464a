//! Cached coarse clock shared between the writer's duty cycle and the
//! allocator.
//!
//! The allocator consults the clock on every `allocate` call to decide
//! whether reclaimed counter IDs have cooled down. Sampling must not cost a
//! syscall on that path, so the clock is a pair of words the owning agent
//! refreshes at whatever cadence it likes; the sample's freshness bound is
//! that cadence. Readers never advance the clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A two-word cached time source `{time_ms, time_ns}`.
///
/// Written by exactly one agent (the writer's duty cycle, or a test driving
/// time by hand) and read without locking. Plain loads are sufficient: the
/// consumer tolerates a stale sample by design.
#[derive(Debug, Default)]
pub struct CachedClock {
    time_ms: AtomicI64,
    time_ns: AtomicI64,
}

impl CachedClock {
    /// Create a clock reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new cached timestamp.
    #[inline]
    pub fn update(&self, ms: i64, ns: i64) {
        self.time_ms.store(ms, Ordering::Relaxed);
        self.time_ns.store(ns, Ordering::Relaxed);
    }

    /// Refresh the cache from the system epoch clock.
    ///
    /// Production duty cycles call this once per iteration; tests drive
    /// [`update`](Self::update) directly instead.
    pub fn update_from_epoch(&self) {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.update(since_epoch.as_millis() as i64, since_epoch.as_nanos() as i64);
    }

    /// The cached timestamp in milliseconds.
    #[inline]
    pub fn time_millis(&self) -> i64 {
        self.time_ms.load(Ordering::Relaxed)
    }

    /// The cached timestamp in nanoseconds.
    #[inline]
    pub fn time_nanos(&self) -> i64 {
        self.time_ns.load(Ordering::Relaxed)
    }
}
