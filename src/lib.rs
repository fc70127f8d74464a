//! # Tallyboard
//!
//! A fixed-capacity, lock-free registry of named 64-bit counters living in
//! shared memory.
//!
//! Counter values and metadata are kept in two caller-supplied,
//! memory-mappable byte regions so that a single writer process and any
//! number of reader processes can observe the same counters without
//! coordination. The writer allocates counters through a
//! [`CountersManager`](manager::CountersManager); observers map the same
//! regions (typically via [`CountersFile`](region::CountersFile)) and scan
//! them with a [`CountersReader`](reader::CountersReader).
//!
//! ## Features
//!
//! - **Header-free layout**: record sizes are published as constants, so
//!   external tools can mmap the regions directly
//! - **Lock-free**: allocation is single-writer, reads are wait-free; the
//!   only synchronization is release/acquire ordering on the state field
//! - **Delayed reuse**: freed counter IDs can be held back for a cooldown
//!   period on a cached, syscall-free clock
//! - **Cache-line isolation**: each counter value owns two full cache lines
//!   so concurrent writers on distinct counters never contend
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tallyboard::prelude::*;
//!
//! // Writer process
//! let mut file = CountersFile::create("/dev/shm/app.counters", 1024)?;
//! let clock = CachedClock::new();
//! clock.update_from_epoch();
//! let mut manager = CountersManager::for_file(&mut file, &clock, Duration::ZERO)?;
//!
//! let id = manager.allocate(7, b"stream-42", "bytes received")?;
//! manager.counter(id).increment_release();
//!
//! // Observer process
//! let file = CountersFile::open_readonly("/dev/shm/app.counters")?;
//! let reader = CountersReader::for_file(&file)?;
//! reader.for_each_metadata(|info| {
//!     println!("{}: {}", info.id, info.label_str());
//! });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod counter;
pub mod error;
pub mod layout;
pub mod manager;
pub mod reader;
pub mod region;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::clock::CachedClock;
    pub use crate::counter::Counter;
    pub use crate::error::{Error, Result};
    pub use crate::layout::{RegionLayout, CACHE_LINE_LENGTH, METADATA_LENGTH, VALUE_LENGTH};
    pub use crate::manager::CountersManager;
    pub use crate::reader::{CounterInfo, CountersReader};
    pub use crate::region::CountersFile;
}

pub use error::{Error, Result};
