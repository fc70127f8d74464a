//! Atomic primitives over a counter's value slot.
//!
//! A [`Counter`] is a transparent view of the `i64` at the start of a value
//! slot. Every accessor comes in explicit-ordering variants: `plain`
//! (relaxed, for single-threaded or externally synchronized use) and
//! `release`/`acquire` pairs that publish updates to concurrent observers.
//! Read-modify-write operations are exact under concurrent callers on the
//! same slot regardless of the ordering variant chosen.

use std::sync::atomic::{AtomicI64, Ordering};

/// A 64-bit counter value in shared memory.
///
/// Obtained from
/// [`CountersManager::counter`](crate::manager::CountersManager::counter)
/// or by wrapping a raw slot address with [`Counter::from_ptr`]. `&Counter`
/// is `Send + Sync`; threads hammering the same slot is the intended use.
#[repr(transparent)]
pub struct Counter(AtomicI64);

impl Counter {
    /// Wrap a raw value-slot address.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned, point into a live values region, and
    /// remain valid for `'a`.
    #[inline]
    pub unsafe fn from_ptr<'a>(ptr: *mut i64) -> &'a Counter {
        debug_assert!(!ptr.is_null());
        debug_assert!((ptr as usize) % std::mem::align_of::<AtomicI64>() == 0);
        // SAFETY: Counter is repr(transparent) over AtomicI64, which has the
        // same layout as i64; validity and lifetime are the caller's
        // contract.
        unsafe { &*(ptr as *const Counter) }
    }

    /// Load without cross-thread ordering.
    #[inline]
    pub fn get_plain(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Acquire-ordered load; pairs with any release store by the writer.
    #[inline]
    pub fn get_acquire(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Store without cross-thread ordering.
    #[inline]
    pub fn set_plain(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Release-ordered store, publishing the value to acquire readers.
    #[inline]
    pub fn set_release(&self, value: i64) {
        self.0.store(value, Ordering::Release);
    }

    /// Add one, returning the prior value. No cross-thread ordering.
    #[inline]
    pub fn increment_plain(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add one, returning the prior value and publishing the new one.
    #[inline]
    pub fn increment_release(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Release)
    }

    /// Add `delta` (which may be negative), returning the prior value. No
    /// cross-thread ordering.
    #[inline]
    pub fn get_and_add_plain(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::Relaxed)
    }

    /// Add `delta` (which may be negative), returning the prior value and
    /// publishing the new one.
    #[inline]
    pub fn get_and_add_release(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::Release)
    }

    /// Store `proposed` iff it exceeds the current value. Returns whether
    /// the store happened. No cross-thread ordering.
    ///
    /// Load-then-store rather than compare-and-swap: the slot has a single
    /// writer by contract.
    #[inline]
    pub fn propose_max_plain(&self, proposed: i64) -> bool {
        if proposed > self.0.load(Ordering::Relaxed) {
            self.0.store(proposed, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Store `proposed` iff it exceeds the current value, publishing it to
    /// acquire readers. Returns whether the store happened.
    #[inline]
    pub fn propose_max_release(&self, proposed: i64) -> bool {
        if proposed > self.0.load(Ordering::Relaxed) {
            self.0.store(proposed, Ordering::Release);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.get_plain()).finish()
    }
}
