//! File-backed provisioning of the counter regions.
//!
//! The registry itself borrows its byte regions from the caller; this
//! module is the piece that supplies them across processes. A
//! [`CountersFile`] maps one file as `[metadata region | values region]`
//! with no header, so an observer only needs the record-size constants from
//! [`layout`](crate::layout) to interpret it: capacity is implied by the
//! file length.
//!
//! The mapping is volatile. Counter state is scratch that dies with the
//! registry; `sync` exists so tools tailing the file see fresh bytes, not
//! for durability.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use tracing::info;

use crate::error::{Error, Result};
use crate::layout::{METADATA_LENGTH, VALUE_LENGTH};

/// Bytes of file required for `capacity` counters.
#[inline]
pub const fn file_length(capacity: usize) -> usize {
    capacity * (METADATA_LENGTH + VALUE_LENGTH)
}

/// A memory-mapped counters file: metadata region followed by values
/// region.
///
/// The writer process creates the file; observer processes open it
/// read-only and scan it with a
/// [`CountersReader`](crate::reader::CountersReader). The mapping is
/// unmapped on drop; the file itself is left behind for late-attaching
/// observers.
pub struct CountersFile {
    /// The mapped file; kept open so observers can re-open by path while
    /// the writer lives.
    _fd: rustix::fd::OwnedFd,
    /// Base of the mapping.
    ptr: NonNull<u8>,
    /// Total mapped length.
    len: usize,
    /// Counter capacity implied by `len`.
    capacity: usize,
    /// Path to the backing file.
    path: PathBuf,
    /// Whether the mapping is read-only.
    read_only: bool,
}

impl CountersFile {
    /// Create (or truncate) a counters file for `capacity` counters.
    ///
    /// The file is zero-filled, so every slot starts `FREE`.
    ///
    /// # Errors
    ///
    /// Returns an error when `capacity` is zero or when open, truncate, or
    /// mmap fails.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path = path.as_ref();

        if capacity == 0 {
            return Err(Error::InvalidLayout(
                "capacity must be greater than 0".into(),
            ));
        }

        let len = file_length(capacity);
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
            Mode::from_raw_mode(0o644),
        )?;
        rustix::fs::ftruncate(&fd, len as u64)?;

        // SAFETY: mapping the `len` bytes the file was just truncated to.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidLayout("mmap returned null".into()))?;

        info!(path = %path.display(), capacity, len, "created counters file");

        Ok(Self {
            _fd: fd,
            ptr,
            len,
            capacity,
            path: path.to_path_buf(),
            read_only: false,
        })
    }

    /// Map an existing counters file read-write.
    ///
    /// Capacity is implied by the file length, which must be an exact
    /// positive multiple of one counter's footprint.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_mode(path.as_ref(), false)
    }

    /// Map an existing counters file read-only, for observers.
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_mode(path.as_ref(), true)
    }

    fn open_with_mode(path: &Path, read_only: bool) -> Result<Self> {
        let flags = if read_only { OFlags::RDONLY } else { OFlags::RDWR };
        let fd = rustix::fs::open(path, flags, Mode::empty())?;

        let len = rustix::fs::fstat(&fd)?.st_size as usize;
        if len == 0 || len % (METADATA_LENGTH + VALUE_LENGTH) != 0 {
            return Err(Error::InvalidLayout(format!(
                "file length {len} is not a positive multiple of a counter footprint ({})",
                METADATA_LENGTH + VALUE_LENGTH
            )));
        }
        let capacity = len / (METADATA_LENGTH + VALUE_LENGTH);

        let prot = if read_only {
            ProtFlags::READ
        } else {
            ProtFlags::READ | ProtFlags::WRITE
        };
        // SAFETY: mapping the whole file we just measured.
        let ptr = unsafe { rustix::mm::mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, &fd, 0)? };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidLayout("mmap returned null".into()))?;

        info!(path = %path.display(), capacity, read_only, "opened counters file");

        Ok(Self {
            _fd: fd,
            ptr,
            len,
            capacity,
            path: path.to_path_buf(),
            read_only,
        })
    }

    /// Counter capacity of the mapped regions.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Base of the metadata region.
    #[inline]
    pub fn metadata_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the metadata region in bytes.
    #[inline]
    pub fn metadata_len(&self) -> usize {
        self.capacity * METADATA_LENGTH
    }

    /// Base of the values region.
    #[inline]
    pub fn values_ptr(&self) -> *mut u8 {
        // SAFETY: the values region starts directly after the metadata
        // region, inside the mapping.
        unsafe { self.ptr.as_ptr().add(self.metadata_len()) }
    }

    /// Length of the values region in bytes.
    #[inline]
    pub fn values_len(&self) -> usize {
        self.capacity * VALUE_LENGTH
    }

    /// The metadata region as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must only read the slice through the synchronization the
    /// registry defines (acquire on a slot's state before its record
    /// bytes); a concurrent writer is mutating the underlying memory.
    #[inline]
    pub unsafe fn metadata(&self) -> &[u8] {
        // SAFETY: in-bounds region of a live mapping.
        unsafe { std::slice::from_raw_parts(self.metadata_ptr(), self.metadata_len()) }
    }

    /// The values region as a byte slice.
    ///
    /// # Safety
    ///
    /// As for [`metadata`](Self::metadata).
    #[inline]
    pub unsafe fn values(&self) -> &[u8] {
        // SAFETY: in-bounds region of a live mapping.
        unsafe { std::slice::from_raw_parts(self.values_ptr(), self.values_len()) }
    }

    /// Flush the mapping to the backing file.
    pub fn sync(&self) -> Result<()> {
        // SAFETY: syncing the whole live mapping.
        unsafe {
            rustix::mm::msync(self.ptr.as_ptr().cast(), self.len, rustix::mm::MsyncFlags::SYNC)?;
        }
        Ok(())
    }

    /// Path to the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the mapping is read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for CountersFile {
    fn drop(&mut self) {
        // SAFETY: unmapping the region this struct mapped.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: shared file mappings can be accessed from any thread; all
// concurrent access goes through the registry's atomic protocol.
unsafe impl Send for CountersFile {}
unsafe impl Sync for CountersFile {}

impl std::fmt::Debug for CountersFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountersFile")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("read_only", &self.read_only)
            .finish()
    }
}
