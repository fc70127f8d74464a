//! Side-only traversal of the counter regions.
//!
//! A [`CountersReader`] never writes, never blocks, and never allocates
//! while scanning. It tolerates a concurrent writer: the acquire load of
//! each slot's state pairs with the manager's release store, so a slot
//! observed `ALLOCATED` has fully visible type/key/label bytes. Slots in
//! any other state are skipped, which lets holes left by freed counters be
//! traversed safely.

use std::borrow::Cow;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::error::{Error, Result};
use crate::layout::{
    self, CounterState, RegionLayout, KEY_OFFSET, LABEL_LENGTH_OFFSET, LABEL_OFFSET,
    MAX_KEY_LENGTH, MAX_LABEL_LENGTH, METADATA_LENGTH, STATE_OFFSET, TYPE_ID_OFFSET,
};
use crate::region::CountersFile;

/// One allocated counter's metadata, borrowed from the live region.
///
/// The key and label point into shared memory that the writer may recycle
/// after the visitor returns; copy anything that needs to outlive the
/// visit.
#[derive(Clone, Copy, Debug)]
pub struct CounterInfo<'a> {
    /// The counter's ID.
    pub id: i32,
    /// Caller-assigned classification tag.
    pub type_id: i32,
    /// The full opaque key window.
    pub key: &'a [u8],
    /// The label bytes.
    pub label: &'a [u8],
}

impl CounterInfo<'_> {
    /// The label as UTF-8, lossily decoded.
    pub fn label_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.label)
    }
}

/// Wait-free reader over a metadata region, optionally paired with its
/// values region.
pub struct CountersReader<'a> {
    metadata: &'a [u8],
    values: Option<&'a [u8]>,
    layout: RegionLayout,
}

impl<'a> CountersReader<'a> {
    /// Reader over a metadata region only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLayout`] when the region length is not a
    /// positive multiple of [`METADATA_LENGTH`] or the base is not 8-byte
    /// aligned.
    pub fn new(metadata: &'a [u8]) -> Result<Self> {
        if metadata.is_empty() || metadata.len() % METADATA_LENGTH != 0 {
            return Err(Error::InvalidLayout(format!(
                "metadata region length {} is not a positive multiple of {METADATA_LENGTH}",
                metadata.len()
            )));
        }
        layout::check_alignment(metadata.as_ptr(), "metadata")?;

        let capacity = metadata.len() / METADATA_LENGTH;
        Ok(Self {
            metadata,
            values: None,
            layout: RegionLayout::with_capacity(capacity)?,
        })
    }

    /// Reader over a metadata/values region pair, enabling
    /// [`counter_value`](Self::counter_value).
    pub fn with_values(metadata: &'a [u8], values: &'a [u8]) -> Result<Self> {
        let region_layout = RegionLayout::new(metadata.len(), values.len())?;
        layout::check_alignment(metadata.as_ptr(), "metadata")?;
        layout::check_alignment(values.as_ptr(), "values")?;

        Ok(Self {
            metadata,
            values: Some(values),
            layout: region_layout,
        })
    }

    /// Reader over both regions of a mapped [`CountersFile`].
    pub fn for_file(file: &'a CountersFile) -> Result<Self> {
        // SAFETY: the mapping lives while `file` is borrowed for 'a; all
        // region access below goes through atomics or follows an acquire
        // of the slot state.
        let (metadata, values) = unsafe { (file.metadata(), file.values()) };
        Self::with_values(metadata, values)
    }

    /// Number of counter slots in the region.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Visit every allocated counter in ascending ID order.
    ///
    /// Each slot's state is loaded with acquire semantics; the visitor runs
    /// exactly once per slot observed `ALLOCATED`, and all other slots are
    /// skipped. Iteration always covers the full capacity.
    pub fn for_each_metadata<F>(&self, mut visitor: F)
    where
        F: FnMut(CounterInfo<'_>),
    {
        for id in 0..self.layout.capacity() as i32 {
            if let Some(info) = self.read_slot(id) {
                visitor(info);
            }
        }
    }

    /// Metadata of a single counter, if it is currently allocated.
    pub fn metadata(&self, id: i32) -> Option<CounterInfo<'_>> {
        if !self.layout.contains(id) {
            return None;
        }
        self.read_slot(id)
    }

    /// Acquire-ordered read of an allocated counter's value.
    ///
    /// `None` when the reader has no values region, `id` is out of range,
    /// or the slot is not allocated.
    pub fn counter_value(&self, id: i32) -> Option<i64> {
        let values = self.values?;
        if !self.layout.contains(id) || self.state(id) != CounterState::Allocated as i32 {
            return None;
        }
        let ptr = values[self.layout.value_offset(id)..].as_ptr();
        // SAFETY: in-range slot start, 8-aligned per construction.
        Some(unsafe { &*ptr.cast::<AtomicI64>() }.load(Ordering::Acquire))
    }

    /// Acquire the slot's state and, when allocated, borrow its metadata.
    fn read_slot(&self, id: i32) -> Option<CounterInfo<'_>> {
        if self.state(id) != CounterState::Allocated as i32 {
            return None;
        }

        let record = &self.metadata[self.layout.metadata_offset(id)..][..METADATA_LENGTH];

        let type_id = i32::from_ne_bytes(
            record[TYPE_ID_OFFSET..TYPE_ID_OFFSET + 4]
                .try_into()
                .expect("4-byte field"),
        );
        let label_length = i32::from_ne_bytes(
            record[LABEL_LENGTH_OFFSET..LABEL_LENGTH_OFFSET + 4]
                .try_into()
                .expect("4-byte field"),
        );
        // The writer bounds the length at allocate; clamp so a corrupt
        // region cannot index outside the record.
        let label_length = (label_length.max(0) as usize).min(MAX_LABEL_LENGTH);

        Some(CounterInfo {
            id,
            type_id,
            key: &record[KEY_OFFSET..KEY_OFFSET + MAX_KEY_LENGTH],
            label: &record[LABEL_OFFSET..LABEL_OFFSET + label_length],
        })
    }

    #[inline]
    fn state(&self, id: i32) -> i32 {
        let ptr = self.metadata[self.layout.metadata_offset(id) + STATE_OFFSET..].as_ptr();
        // SAFETY: the state field is at a 4-aligned offset of an 8-aligned
        // base, inside the region for in-range ids.
        unsafe { &*ptr.cast::<AtomicI32>() }.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CountersReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountersReader")
            .field("capacity", &self.layout.capacity())
            .field("has_values", &self.values.is_some())
            .finish()
    }
}
