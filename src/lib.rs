//! Growmap exposes memory-mapped files and resizable memory regions whose
//! data pointer stays put while the region grows. A [`ResizableFile`] or
//! [`ResizableMemory`] reserves its maximum capacity of virtual address
//! space once, up front, and then grows a committed, file- or memory-backed
//! mapping into that reservation, so pointers handed out before a
//! [`resize`](ResizableFile::resize) remain valid after it.
//!
//! ## Terminology
//!
//! A given region of memory can be reserved, committed, or backed.
//!
//! - A **reserved** region is a range of virtual addresses the OS promises
//!   not to hand to any other allocator. Its pages are inaccessible and it
//!   does not count toward the process' commit charge.
//!
//! - A **committed** region has backing arranged (RAM, swap, or file) and
//!   access permissions granted. Committing happens at page granularity;
//!   the page size varies between operating systems and is queried at
//!   runtime through [`page_size`].
//!
//! - A **view** is a live mapping of a backing object into the process'
//!   address space. Each mapping object here owns at most one view, pinned
//!   inside its reservation.
//!
//! ## Example
//!
//! ```
//! use growmap::ResizableFile;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut file = ResizableFile::open(dir.path().join("data.bin"), 1 << 20).unwrap();
//! assert!(file.as_ptr().is_null());
//!
//! file.resize(40).unwrap();
//! let base = file.as_ptr();
//! file.as_mut_slice()[..5].copy_from_slice(b"hello");
//!
//! // Growing does not move the data.
//! file.resize(4096).unwrap();
//! assert_eq!(file.as_ptr(), base);
//! assert_eq!(&file.as_slice()[..5], b"hello");
//! ```
//!
//! ## Thread safety
//!
//! A mapping object is a single-owner resource: `resize`, `flush`, and drop
//! take `&mut self` or consume the value, so the borrow checker serializes
//! them. Shared `&self` access only permits reads, which may proceed
//! concurrently. The library takes no file locks and does not coordinate
//! with other processes mapping the same file.

use std::fmt;
use std::path::Path;
use std::slice;

mod error;
mod sys;
#[cfg(test)]
mod tests;

pub use error::{Error, MappedFileError, MappingError, Result};

/// The OS page size: the granularity of protection and commit operations.
/// Queried once and cached.
pub fn page_size() -> usize {
    sys::page_size()
}

/// The minimum alignment of a view's base address. Equal to [`page_size`]
/// on POSIX; typically coarser on Windows.
pub fn allocation_granularity() -> usize {
    sys::allocation_granularity()
}

fn check_range(offset: usize, len: usize, mapped: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= mapped => Ok(()),
        _ => Err(MappingError::invalid_range("flush_range").into()),
    }
}

/// Read-only mapping of an entire file at its current size.
///
/// Empty files are accepted and map to a zero-length region whose
/// [`as_ptr`](Self::as_ptr) is null; [`as_slice`](Self::as_slice) is the
/// safe accessor either way.
pub struct MappedFile {
    inner: sys::MappedFile,
}

// Safety: the mapping is exclusively owned, the underlying OS resources are
// not thread-affine, and `&self` exposes only reads of memory nothing else
// can mutate through this type.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Opens `path` read-only and maps its full contents.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            inner: sys::MappedFile::open(path.as_ref())?,
        })
    }

    /// Base of the mapping; null when the file was empty. Never dereference
    /// the null pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        let len = self.inner.len();
        if len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.inner.as_ptr(), len) }
        }
    }

    /// Length of the mapping, equal to the file size at open time.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFile")
            .field("len", &self.len())
            .finish()
    }
}

/// Writable shared mapping of an entire existing file.
///
/// Stores propagate to the file. Drop performs a best-effort flush; callers
/// that need durability must call [`flush`](Self::flush) and handle its
/// error, because drop has no caller to report to.
pub struct WritableMappedFile {
    inner: sys::WritableMappedFile,
}

// Safety: as for `MappedFile`; writes require `&mut self`.
unsafe impl Send for WritableMappedFile {}
unsafe impl Sync for WritableMappedFile {}

impl WritableMappedFile {
    /// Opens an existing file read-write and maps its full contents.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            inner: sys::WritableMappedFile::open(path.as_ref())?,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        let len = self.inner.len();
        if len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.inner.as_ptr(), len) }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.inner.len();
        if len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.inner.as_mut_ptr(), len) }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Synchronously flushes all dirty pages to the file.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_range(0, self.inner.len())
    }

    /// Synchronously flushes `[offset, offset + len)`.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        check_range(offset, len, self.inner.len())?;
        self.inner.flush_range(offset, len)
    }
}

impl fmt::Debug for WritableMappedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableMappedFile")
            .field("len", &self.len())
            .finish()
    }
}

/// File-backed mapping that can grow and shrink without moving.
///
/// Construction reserves `capacity` bytes of address space and opens (or
/// creates) the backing file; a non-empty file is mapped immediately at the
/// reservation base. [`resize`](Self::resize) adjusts both the file length
/// and the mapped region while [`as_ptr`](Self::as_ptr) stays constant —
/// the one exception is `resize(0)`, which tears the mapping down entirely,
/// so the next grow may pick a fresh base.
pub struct ResizableFile {
    inner: sys::ResizableFile,
}

// Safety: as for `MappedFile`; mutation requires `&mut self`.
unsafe impl Send for ResizableFile {}
unsafe impl Sync for ResizableFile {}

impl ResizableFile {
    /// Opens or creates `path` with room to grow to `capacity` bytes.
    ///
    /// Fails with [`Error::OutOfMemory`] if the file already holds more
    /// than `capacity` bytes; the file is not modified in that case.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: sys::ResizableFile::open(path.as_ref(), capacity)?,
        })
    }

    /// Resizes the backing file and the mapping to `new_len` bytes.
    ///
    /// On success the on-disk length equals `new_len` and the data pointer
    /// is unchanged (unless the mapping was empty or `new_len` is zero).
    /// `new_len > capacity` fails with [`Error::OutOfMemory`] and leaves
    /// the mapping untouched.
    ///
    /// On POSIX the old view is torn down before the new one is installed;
    /// if the OS rejects the new mapping inside that window, the object is
    /// left empty (`as_ptr()` null, `len()` zero) and a later `resize` may
    /// recover it.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        self.inner.resize(new_len)
    }

    /// Base of the mapping; null while the mapping is empty. Stable across
    /// every successful `resize` to a non-zero length.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        let len = self.inner.len();
        if len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.inner.as_ptr(), len) }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.inner.len();
        if len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.inner.as_mut_ptr(), len) }
        }
    }

    /// Current length; always equal to the on-disk file length.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Maximum length this mapping can grow to; fixed at construction.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Synchronously flushes all dirty pages to the file.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_range(0, self.inner.len())
    }

    /// Synchronously flushes `[offset, offset + len)`.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        check_range(offset, len, self.inner.len())?;
        self.inner.flush_range(offset, len)
    }
}

impl fmt::Debug for ResizableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResizableFile")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Anonymous memory region that can grow and shrink without moving.
///
/// The reservation made at construction is the backing store; `resize`
/// commits or decommits whole pages of it in place. Shrinking logically
/// discards the bytes past the new length and releases their physical
/// pages, but the address range stays reserved, so a later grow finds
/// zeroed pages at the same addresses.
pub struct ResizableMemory {
    inner: sys::ResizableMemory,
}

// Safety: as for `MappedFile`; mutation requires `&mut self`.
unsafe impl Send for ResizableMemory {}
unsafe impl Sync for ResizableMemory {}

impl ResizableMemory {
    /// Reserves `capacity` bytes and commits room for `initial_len`.
    pub fn new(initial_len: usize, capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: sys::ResizableMemory::new(initial_len, capacity)?,
        })
    }

    /// Grows or shrinks the region to `new_len` bytes.
    ///
    /// `new_len > capacity` fails with [`Error::OutOfMemory`] and leaves
    /// the region untouched. Bytes below `min(old, new)` are preserved.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        self.inner.resize(new_len)
    }

    /// Base of the region; null while the length is zero, otherwise stable
    /// for the lifetime of the object.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        let len = self.inner.len();
        if len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.inner.as_ptr(), len) }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.inner.len();
        if len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.inner.as_mut_ptr(), len) }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Maximum length this region can grow to; fixed at construction.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl fmt::Debug for ResizableMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResizableMemory")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
