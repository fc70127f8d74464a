//! The single-writer counter allocator.
//!
//! [`CountersManager`] owns the `FREE -> ALLOCATED -> RECLAIMED -> FREE`
//! lifecycle of every slot in a metadata/values region pair. It is the only
//! agent that mutates metadata; readers traverse the same bytes
//! concurrently through [`CountersReader`](crate::reader::CountersReader)
//! relying on the release store of the state field as the publication
//! point.
//!
//! The manager borrows the regions, it never owns or unmaps them.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::CachedClock;
use crate::counter::Counter;
use crate::error::{Error, Result};
use crate::layout::{
    self, CounterState, RegionLayout, DEADLINE_OFFSET, KEY_OFFSET, LABEL_LENGTH_OFFSET,
    LABEL_OFFSET, MAX_KEY_LENGTH, MAX_LABEL_LENGTH, NOT_FREE_TO_REUSE, STATE_OFFSET,
    TYPE_ID_OFFSET,
};
use crate::region::CountersFile;

/// Fixed-capacity allocator of named 64-bit counters in shared memory.
///
/// Exactly one manager may write a region pair at a time; that exclusivity
/// is a cross-process contract the type system cannot check, documented on
/// [`from_raw_parts`](Self::from_raw_parts). Within the process the
/// allocating methods take `&mut self`.
///
/// Allocation is deterministic: the lowest eligible ID wins, and
/// previously-used IDs whose cooldown has lapsed are preferred over
/// never-used ones.
pub struct CountersManager<'a> {
    /// Base of the metadata region.
    metadata: NonNull<u8>,
    /// Base of the values region.
    values: NonNull<u8>,
    /// Validated addressing over both regions.
    layout: RegionLayout,
    /// Coarse time source sampled on every allocate.
    clock: &'a CachedClock,
    /// Minimum age of a freed ID before it may be recycled.
    reuse_cooldown_ms: i64,
    /// Next never-used ID.
    high_water_mark: i32,
    /// Freed IDs, sorted ascending. Entries may still be cooling down.
    free_list: Vec<i32>,
    /// The regions are borrowed for `'a`; the manager never frees them.
    _regions: PhantomData<&'a mut [u8]>,
}

impl<'a> CountersManager<'a> {
    /// Construct a manager over caller-provided byte regions.
    ///
    /// Capacity is implied by region length. Every slot must start out
    /// zeroed (all states `FREE`); [`CountersFile::create`] provides that.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLayout`] when either region length is not an
    /// exact positive multiple of its record size, when the implied
    /// capacities disagree, or when either base address is null or not
    /// 8-byte aligned.
    ///
    /// # Safety
    ///
    /// The caller guarantees that:
    ///
    /// - both regions are valid for reads and writes of the given lengths
    ///   and strictly outlive `'a`;
    /// - no other `CountersManager` (in this or any other process) writes
    ///   the same regions while this one is alive;
    /// - concurrent access by other parties is limited to reads.
    pub unsafe fn from_raw_parts(
        metadata: *mut u8,
        metadata_len: usize,
        values: *mut u8,
        values_len: usize,
        clock: &'a CachedClock,
        reuse_cooldown: Duration,
    ) -> Result<Self> {
        let region_layout = RegionLayout::new(metadata_len, values_len)?;
        layout::check_alignment(metadata, "metadata")?;
        layout::check_alignment(values, "values")?;

        let metadata = NonNull::new(metadata)
            .ok_or_else(|| Error::InvalidLayout("metadata region base is null".into()))?;
        let values = NonNull::new(values)
            .ok_or_else(|| Error::InvalidLayout("values region base is null".into()))?;

        Ok(Self {
            metadata,
            values,
            layout: region_layout,
            clock,
            reuse_cooldown_ms: reuse_cooldown.as_millis() as i64,
            high_water_mark: 0,
            free_list: Vec::new(),
            _regions: PhantomData,
        })
    }

    /// Construct a manager over the regions of a freshly created
    /// [`CountersFile`].
    ///
    /// The exclusive borrow keeps any in-process reader or second manager
    /// off the same mapping; single-writer exclusivity across processes
    /// remains the caller's contract.
    pub fn for_file(
        file: &'a mut CountersFile,
        clock: &'a CachedClock,
        reuse_cooldown: Duration,
    ) -> Result<Self> {
        if file.is_read_only() {
            return Err(Error::ReadOnlyRegion);
        }
        // SAFETY: the mapping lives while `file` is borrowed for 'a, and the
        // borrow is exclusive.
        unsafe {
            Self::from_raw_parts(
                file.metadata_ptr(),
                file.metadata_len(),
                file.values_ptr(),
                file.values_len(),
                clock,
                reuse_cooldown,
            )
        }
    }

    /// Number of counter slots in the regions.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// IDs not currently allocated.
    ///
    /// Freed IDs still inside their reuse cooldown are counted even though
    /// an immediate `allocate` may not take them.
    pub fn available(&self) -> usize {
        self.free_list.len() + (self.layout.capacity() - self.high_water_mark as usize)
    }

    /// The configured reuse cooldown.
    pub fn reuse_cooldown(&self) -> Duration {
        Duration::from_millis(self.reuse_cooldown_ms as u64)
    }

    /// Allocate a counter, returning its ID.
    ///
    /// Writes `type_id`, `key`, and `label` into the metadata slot with
    /// plain stores, zeroes the counter value, then publishes the slot with
    /// a release store of `ALLOCATED`; a reader observing that state with
    /// acquire ordering sees all of the metadata bytes.
    ///
    /// # Errors
    ///
    /// [`Error::Exhausted`] when no ID is reusable (registry full, or every
    /// freed ID is still cooling down); [`Error::KeyTooLong`] /
    /// [`Error::LabelTooLong`] when the arguments do not fit the record
    /// layout. No slot is mutated on any error.
    pub fn allocate(&mut self, type_id: i32, key: &[u8], label: &str) -> Result<i32> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::KeyTooLong {
                length: key.len(),
                max: MAX_KEY_LENGTH,
            });
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(Error::LabelTooLong {
                length: label.len(),
                max: MAX_LABEL_LENGTH,
            });
        }

        let id = self.next_counter_id()?;
        let record = self.metadata_ptr(id);

        // Plain stores; ordered before the state store by the release below.
        // SAFETY: `id` is in range, so every offset stays inside the record.
        unsafe {
            std::ptr::write(record.add(TYPE_ID_OFFSET).cast::<i32>(), type_id);
            std::ptr::write(record.add(DEADLINE_OFFSET).cast::<i64>(), NOT_FREE_TO_REUSE);

            let key_area = record.add(KEY_OFFSET);
            std::ptr::copy_nonoverlapping(key.as_ptr(), key_area, key.len());
            std::ptr::write_bytes(key_area.add(key.len()), 0, MAX_KEY_LENGTH - key.len());

            std::ptr::write(
                record.add(LABEL_LENGTH_OFFSET).cast::<i32>(),
                label.len() as i32,
            );
            let label_area = record.add(LABEL_OFFSET);
            std::ptr::copy_nonoverlapping(label.as_ptr(), label_area, label.len());
            std::ptr::write_bytes(label_area.add(label.len()), 0, MAX_LABEL_LENGTH - label.len());
        }

        // A recycled slot must read zero before it becomes visible.
        self.counter(id).set_plain(0);

        self.state(id)
            .store(CounterState::Allocated as i32, Ordering::Release);

        debug!(id, type_id, label, "allocated counter");
        Ok(id)
    }

    /// Return a counter's ID to the pool.
    ///
    /// With a zero cooldown the slot goes straight back to `FREE`;
    /// otherwise it is marked `RECLAIMED` with a deadline of `now +
    /// cooldown` on the cached clock, and a later `allocate` recycles it
    /// once the deadline has passed.
    ///
    /// # Errors
    ///
    /// [`Error::IdOutOfRange`] or [`Error::NotAllocated`] when `id` does
    /// not refer to a live counter.
    pub fn free(&mut self, id: i32) -> Result<()> {
        if !self.layout.contains(id) {
            return Err(Error::IdOutOfRange(id));
        }
        let state = self.state(id);
        if state.load(Ordering::Relaxed) != CounterState::Allocated as i32 {
            return Err(Error::NotAllocated(id));
        }

        let (deadline, next_state) = if self.reuse_cooldown_ms == 0 {
            (0, CounterState::Free)
        } else {
            (
                self.clock.time_millis() + self.reuse_cooldown_ms,
                CounterState::Reclaimed,
            )
        };

        // SAFETY: `id` is in range.
        unsafe {
            std::ptr::write(
                self.metadata_ptr(id).add(DEADLINE_OFFSET).cast::<i64>(),
                deadline,
            );
        }
        state.store(next_state as i32, Ordering::Release);

        if let Err(pos) = self.free_list.binary_search(&id) {
            self.free_list.insert(pos, id);
        }

        debug!(id, cooldown_ms = self.reuse_cooldown_ms, "freed counter");
        Ok(())
    }

    /// Raw address of the counter value for `id`.
    ///
    /// The pointer is stable for the lifetime of the regions; it remains
    /// valid across `free` and reallocation of the same ID.
    #[inline]
    pub fn counter_addr(&self, id: i32) -> *mut i64 {
        debug_assert!(self.layout.contains(id), "counter id {id} out of range");
        // SAFETY: offset stays inside the values region for in-range ids.
        unsafe { self.values.as_ptr().add(self.layout.value_offset(id)).cast::<i64>() }
    }

    /// Atomic view of the counter value for `id`.
    ///
    /// # Panics
    ///
    /// Panics when `id` is outside `[0, capacity)`.
    #[inline]
    pub fn counter(&self, id: i32) -> &Counter {
        assert!(self.layout.contains(id), "counter id {id} out of range");
        // SAFETY: in-range slot address, aligned per construction, valid
        // for the region borrow 'a.
        unsafe { Counter::from_ptr(self.counter_addr(id)) }
    }

    /// Pick the lowest eligible ID: a freed ID whose deadline has passed,
    /// else the next never-used one.
    fn next_counter_id(&mut self) -> Result<i32> {
        let now = self.clock.time_millis();
        if let Some(pos) = self
            .free_list
            .iter()
            .position(|&id| self.deadline(id) <= now)
        {
            return Ok(self.free_list.remove(pos));
        }

        if (self.high_water_mark as usize) < self.layout.capacity() {
            let id = self.high_water_mark;
            self.high_water_mark += 1;
            return Ok(id);
        }

        warn!(capacity = self.layout.capacity(), "counters exhausted");
        Err(Error::Exhausted)
    }

    #[inline]
    fn metadata_ptr(&self, id: i32) -> *mut u8 {
        // SAFETY: callers pass in-range ids.
        unsafe { self.metadata.as_ptr().add(self.layout.metadata_offset(id)) }
    }

    #[inline]
    fn state(&self, id: i32) -> &AtomicI32 {
        // SAFETY: the state field is at a 4-aligned offset of an 8-aligned
        // base, inside the region for in-range ids.
        unsafe { &*self.metadata_ptr(id).add(STATE_OFFSET).cast::<AtomicI32>() }
    }

    #[inline]
    fn deadline(&self, id: i32) -> i64 {
        // SAFETY: in-range id, aligned per construction. Only the writer
        // stores deadlines, so a plain read cannot tear.
        unsafe { std::ptr::read(self.metadata_ptr(id).add(DEADLINE_OFFSET).cast::<i64>()) }
    }
}

// SAFETY: the manager can move to another thread; it is the sole writer and
// holds no thread-affine state. It is deliberately not Sync.
unsafe impl Send for CountersManager<'_> {}

impl std::fmt::Debug for CountersManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountersManager")
            .field("capacity", &self.layout.capacity())
            .field("high_water_mark", &self.high_water_mark)
            .field("free_list", &self.free_list)
            .field("reuse_cooldown_ms", &self.reuse_cooldown_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{METADATA_LENGTH, VALUE_LENGTH};

    const NUM_COUNTERS: usize = 4;
    const COOLDOWN: Duration = Duration::from_millis(1000);

    /// Region pair with the alignment an mmap'd file gets for free.
    #[repr(C, align(64))]
    struct Regions {
        metadata: [u8; NUM_COUNTERS * METADATA_LENGTH],
        values: [u8; NUM_COUNTERS * VALUE_LENGTH],
    }

    impl Regions {
        fn new() -> Box<Self> {
            Box::new(Self {
                metadata: [0; NUM_COUNTERS * METADATA_LENGTH],
                values: [0; NUM_COUNTERS * VALUE_LENGTH],
            })
        }
    }

    fn manager<'a>(
        regions: &'a mut Regions,
        clock: &'a CachedClock,
        cooldown: Duration,
    ) -> CountersManager<'a> {
        unsafe {
            CountersManager::from_raw_parts(
                regions.metadata.as_mut_ptr(),
                regions.metadata.len(),
                regions.values.as_mut_ptr(),
                regions.values.len(),
                clock,
                cooldown,
            )
        }
        .expect("valid test regions")
    }

    #[test]
    fn test_rejects_ragged_region_lengths() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let result = unsafe {
            CountersManager::from_raw_parts(
                regions.metadata.as_mut_ptr(),
                regions.metadata.len() - 1,
                regions.values.as_mut_ptr(),
                regions.values.len(),
                &clock,
                Duration::ZERO,
            )
        };
        assert!(matches!(result, Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_rejects_capacity_mismatch() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let result = unsafe {
            CountersManager::from_raw_parts(
                regions.metadata.as_mut_ptr(),
                regions.metadata.len(),
                regions.values.as_mut_ptr(),
                regions.values.len() - VALUE_LENGTH,
                &clock,
                Duration::ZERO,
            )
        };
        assert!(matches!(result, Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_rejects_misaligned_base() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let result = unsafe {
            CountersManager::from_raw_parts(
                regions.metadata.as_mut_ptr().add(4),
                regions.metadata.len() - METADATA_LENGTH,
                regions.values.as_mut_ptr(),
                regions.values.len() - VALUE_LENGTH,
                &clock,
                Duration::ZERO,
            )
        };
        assert!(matches!(result, Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn test_allocates_ascending_ids_until_full() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        assert_eq!(mgr.capacity(), NUM_COUNTERS);
        for (expected, label) in ["lab0", "lab1", "lab2", "lab3"].iter().enumerate() {
            assert_eq!(mgr.allocate(0, b"", label).unwrap(), expected as i32);
        }
        assert!(matches!(mgr.allocate(0, b"", "lab4"), Err(Error::Exhausted)));
    }

    #[test]
    fn test_oversize_label_and_key_are_rejected() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        let long_label = "x".repeat(MAX_LABEL_LENGTH + 1);
        assert!(matches!(
            mgr.allocate(0, b"", &long_label),
            Err(Error::LabelTooLong { .. })
        ));

        let long_key = vec![0u8; MAX_KEY_LENGTH + 1];
        assert!(matches!(
            mgr.allocate(0, &long_key, "ok"),
            Err(Error::KeyTooLong { .. })
        ));

        // Rejections touched no slot: id 0 is still first out.
        assert_eq!(mgr.allocate(0, b"", "ok").unwrap(), 0);
    }

    #[test]
    fn test_recycles_freed_id() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        for label in ["lab0", "lab1", "lab2", "lab3"] {
            mgr.allocate(0, b"", label).unwrap();
        }
        mgr.free(2).unwrap();
        assert_eq!(mgr.allocate(0, b"", "newLab2").unwrap(), 2);
    }

    #[test]
    fn test_freed_id_preferred_over_never_used() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        mgr.allocate(0, b"", "abc").unwrap();
        let def = mgr.allocate(0, b"", "def").unwrap();
        mgr.allocate(0, b"", "ghi").unwrap();

        mgr.free(def).unwrap();
        assert_eq!(mgr.allocate(0, b"", "the next label").unwrap(), def);
    }

    #[test]
    fn test_lowest_eligible_id_wins() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        for label in ["lab0", "lab1", "lab2", "lab3"] {
            mgr.allocate(0, b"", label).unwrap();
        }
        mgr.free(3).unwrap();
        mgr.free(1).unwrap();
        assert_eq!(mgr.allocate(0, b"", "first").unwrap(), 1);
        assert_eq!(mgr.allocate(0, b"", "second").unwrap(), 3);
    }

    #[test]
    fn test_cooldown_blocks_reuse_before_deadline() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, COOLDOWN);

        mgr.allocate(0, b"", "abc").unwrap();
        let def = mgr.allocate(0, b"", "def").unwrap();
        let ghi = mgr.allocate(0, b"", "ghi").unwrap();

        mgr.free(def).unwrap();

        clock.update(COOLDOWN.as_millis() as i64 - 1, 0);
        assert!(mgr.allocate(0, b"", "the next label").unwrap() > ghi);
    }

    #[test]
    fn test_cooldown_allows_reuse_at_deadline() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, COOLDOWN);

        mgr.allocate(0, b"", "abc").unwrap();
        let def = mgr.allocate(0, b"", "def").unwrap();
        mgr.allocate(0, b"", "ghi").unwrap();

        mgr.free(def).unwrap();

        clock.update(COOLDOWN.as_millis() as i64, 0);
        assert_eq!(mgr.allocate(0, b"", "the next label").unwrap(), def);
    }

    #[test]
    fn test_free_validates_id() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        assert!(matches!(mgr.free(-1), Err(Error::IdOutOfRange(-1))));
        assert!(matches!(mgr.free(4), Err(Error::IdOutOfRange(4))));
        assert!(matches!(mgr.free(0), Err(Error::NotAllocated(0))));

        mgr.allocate(0, b"", "abc").unwrap();
        mgr.free(0).unwrap();
        assert!(matches!(mgr.free(0), Err(Error::NotAllocated(0))));
    }

    #[test]
    fn test_store_and_load_through_addr() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        let id = mgr.allocate(0, b"", "abc").unwrap();
        let counter = unsafe { Counter::from_ptr(mgr.counter_addr(id)) };

        counter.set_release(7);
        assert_eq!(counter.get_plain(), 7);
        assert_eq!(counter.get_acquire(), 7);
        assert_eq!(mgr.counter(id).get_plain(), 7);
    }

    #[test]
    fn test_recycled_counter_value_reads_zero() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        let id = mgr.allocate(0, b"", "abc").unwrap();
        mgr.counter(id).set_release(999);
        mgr.free(id).unwrap();

        let recycled = mgr.allocate(0, b"", "fresh").unwrap();
        assert_eq!(recycled, id);
        assert_eq!(mgr.counter(recycled).get_plain(), 0);
    }

    #[test]
    fn test_available_accounting() {
        let mut regions = Regions::new();
        let clock = CachedClock::new();
        let mut mgr = manager(&mut regions, &clock, Duration::ZERO);

        assert_eq!(mgr.available(), NUM_COUNTERS);
        mgr.allocate(0, b"", "a").unwrap();
        mgr.allocate(0, b"", "b").unwrap();
        assert_eq!(mgr.available(), NUM_COUNTERS - 2);
        mgr.free(0).unwrap();
        assert_eq!(mgr.available(), NUM_COUNTERS - 1);
    }
}
