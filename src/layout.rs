//! Byte-exact layout of the metadata and values regions.
//!
//! Both regions are flat arrays of fixed-size records with no header; the
//! record sizes below are the wire format, published so that external tools
//! can mmap a counters file directly. All multi-byte fields are stored in
//! the platform byte order, which is little-endian on every supported
//! target.
//!
//! The slot at index `i` of the metadata region describes the counter whose
//! value lives at index `i` of the values region, and `i` is the counter's
//! ID.

use crate::error::{Error, Result};

/// Cache line length the layout is padded against.
pub const CACHE_LINE_LENGTH: usize = 64;

/// Size of one metadata record in bytes.
///
/// The state/type/deadline header plus the key area fill the first two
/// cache lines; the label area fills the remaining six.
pub const METADATA_LENGTH: usize = 8 * CACHE_LINE_LENGTH;

/// Size of one value record in bytes.
///
/// A single `i64` counter followed by padding. Two full cache lines keep
/// neighbouring counters from contending even with adjacent-line
/// prefetching.
pub const VALUE_LENGTH: usize = 2 * CACHE_LINE_LENGTH;

/// Offset of the state field within a metadata record.
pub const STATE_OFFSET: usize = 0;

/// Offset of the type ID field within a metadata record.
pub const TYPE_ID_OFFSET: usize = 4;

/// Offset of the free-for-reuse deadline within a metadata record.
pub const DEADLINE_OFFSET: usize = 8;

/// Offset of the key area within a metadata record.
pub const KEY_OFFSET: usize = 16;

/// Bytes of record header preceding the key area.
pub const KEY_HEADER_LENGTH: usize = KEY_OFFSET;

/// Size of the opaque key area in bytes.
pub const MAX_KEY_LENGTH: usize = (2 * CACHE_LINE_LENGTH) - KEY_OFFSET;

/// Offset of the label length prefix within a metadata record.
pub const LABEL_LENGTH_OFFSET: usize = 2 * CACHE_LINE_LENGTH;

/// Offset of the label bytes within a metadata record.
pub const LABEL_OFFSET: usize = LABEL_LENGTH_OFFSET + 4;

/// Maximum label length in bytes.
pub const MAX_LABEL_LENGTH: usize = METADATA_LENGTH - LABEL_OFFSET;

/// Deadline sentinel stored while a counter is allocated.
pub const NOT_FREE_TO_REUSE: i64 = i64::MAX;

/// Minimum alignment required of both region base addresses.
///
/// The deadline field and the counter value are 8-byte atomics; records are
/// a multiple of 8 bytes, so aligning the base aligns every field.
pub const REGION_ALIGNMENT: usize = 8;

// The key header plus the key area fill the first two cache lines exactly.
const _: () = assert!(KEY_HEADER_LENGTH + MAX_KEY_LENGTH == 2 * CACHE_LINE_LENGTH);

/// Lifecycle state of a metadata slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CounterState {
    /// Slot has never been used, or its cooldown has lapsed and it was
    /// handed back to the pool.
    Free = 0,
    /// Slot describes a live counter.
    Allocated = 1,
    /// Slot was freed with a reuse cooldown that has not yet elapsed.
    Reclaimed = 2,
}

impl CounterState {
    /// Decode a raw state value read from a region.
    #[inline]
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(CounterState::Free),
            1 => Some(CounterState::Allocated),
            2 => Some(CounterState::Reclaimed),
            _ => None,
        }
    }
}

/// One metadata record as it appears in the metadata region.
///
/// Field order and sizes are fixed; the struct exists for offset arithmetic
/// and for external tools that want a typed view. Live regions are accessed
/// through [`CountersManager`](crate::manager::CountersManager) and
/// [`CountersReader`](crate::reader::CountersReader), which apply the
/// required atomic orderings to `state`.
#[repr(C)]
pub struct CounterMetadata {
    /// Lifecycle state, one of [`CounterState`].
    pub state: i32,
    /// Caller-assigned classification tag.
    pub type_id: i32,
    /// Cached-clock timestamp (ms) after which a reclaimed slot may be
    /// recycled; [`NOT_FREE_TO_REUSE`] while allocated.
    pub free_for_reuse_deadline_ms: i64,
    /// Opaque key bytes chosen by the caller.
    pub key: [u8; MAX_KEY_LENGTH],
    /// Length of the UTF-8 label in `label`.
    pub label_length: i32,
    /// Label bytes; only the first `label_length` are meaningful.
    pub label: [u8; MAX_LABEL_LENGTH],
}

const _: () = assert!(std::mem::size_of::<CounterMetadata>() == METADATA_LENGTH);

/// One value record as it appears in the values region.
#[repr(C)]
pub struct CounterValue {
    /// The 64-bit counter value.
    pub value: i64,
    /// Padding out to [`VALUE_LENGTH`].
    pub _pad: [u8; VALUE_LENGTH - 8],
}

const _: () = assert!(std::mem::size_of::<CounterValue>() == VALUE_LENGTH);

// ============================================================================
// Known key layouts
// ============================================================================

/// Key layout for per-stream position counters.
///
/// Typical messaging-system use: the key identifies which stream of which
/// session a position counter belongs to.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct StreamPositionKey {
    /// Registration that owns the position.
    pub registration_id: i64,
    /// Session the stream belongs to.
    pub session_id: i32,
    /// Stream within the session.
    pub stream_id: i32,
}

/// Key layout for channel endpoint status counters.
#[repr(C)]
pub struct ChannelEndpointKey {
    /// Length of the channel URI in `channel`.
    pub channel_length: i32,
    /// Channel URI bytes, truncated to fit the key area.
    pub channel: [u8; MAX_KEY_LENGTH - 8],
}

// Every known key layout must fit, with the record header, inside the first
// two cache lines of a metadata record.
const _: () =
    assert!(KEY_HEADER_LENGTH + std::mem::size_of::<StreamPositionKey>() <= 2 * CACHE_LINE_LENGTH);
const _: () =
    assert!(KEY_HEADER_LENGTH + std::mem::size_of::<ChannelEndpointKey>() <= 2 * CACHE_LINE_LENGTH);

// ============================================================================
// Region addressing
// ============================================================================

/// Validated addressing over a metadata/values region pair.
///
/// Capacity is implied by region length: `metadata_len / METADATA_LENGTH`
/// and `values_len / VALUE_LENGTH` must agree exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    capacity: usize,
}

impl RegionLayout {
    /// Validate a region pair and derive the counter capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLayout`] when either length is zero or not
    /// an exact multiple of its record size, or when the two implied
    /// capacities disagree.
    pub fn new(metadata_len: usize, values_len: usize) -> Result<Self> {
        if metadata_len == 0 || metadata_len % METADATA_LENGTH != 0 {
            return Err(Error::InvalidLayout(format!(
                "metadata region length {metadata_len} is not a positive multiple of {METADATA_LENGTH}"
            )));
        }
        if values_len == 0 || values_len % VALUE_LENGTH != 0 {
            return Err(Error::InvalidLayout(format!(
                "values region length {values_len} is not a positive multiple of {VALUE_LENGTH}"
            )));
        }

        let metadata_capacity = metadata_len / METADATA_LENGTH;
        let values_capacity = values_len / VALUE_LENGTH;
        if metadata_capacity != values_capacity {
            return Err(Error::InvalidLayout(format!(
                "regions imply different capacities: {metadata_capacity} metadata slots vs {values_capacity} value slots"
            )));
        }

        Ok(Self {
            capacity: metadata_capacity,
        })
    }

    /// Addressing for a known capacity (both regions exactly sized).
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::new(capacity * METADATA_LENGTH, capacity * VALUE_LENGTH)
    }

    /// Number of counter slots in the regions.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Byte offset of metadata slot `id` from the metadata base.
    #[inline]
    pub const fn metadata_offset(&self, id: i32) -> usize {
        id as usize * METADATA_LENGTH
    }

    /// Byte offset of value slot `id` from the values base.
    #[inline]
    pub const fn value_offset(&self, id: i32) -> usize {
        id as usize * VALUE_LENGTH
    }

    /// Whether `id` addresses a slot inside the regions.
    #[inline]
    pub const fn contains(&self, id: i32) -> bool {
        id >= 0 && (id as usize) < self.capacity
    }

    /// Required metadata region length for `capacity` slots.
    #[inline]
    pub const fn metadata_len(capacity: usize) -> usize {
        capacity * METADATA_LENGTH
    }

    /// Required values region length for `capacity` slots.
    #[inline]
    pub const fn values_len(capacity: usize) -> usize {
        capacity * VALUE_LENGTH
    }
}

/// Check a region base address against [`REGION_ALIGNMENT`].
pub(crate) fn check_alignment(ptr: *const u8, region: &str) -> Result<()> {
    if (ptr as usize) % REGION_ALIGNMENT != 0 {
        return Err(Error::InvalidLayout(format!(
            "{region} region base {ptr:p} is not {REGION_ALIGNMENT}-byte aligned"
        )));
    }
    Ok(())
}
