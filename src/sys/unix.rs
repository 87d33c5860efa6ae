//! POSIX back-end.
//!
//! Everything here is built from four `mmap(2)` idioms:
//!
//! - a `PROT_NONE`, `MAP_NORESERVE` anonymous map reserves address space
//!   without consuming commit charge,
//! - a `MAP_FIXED` map installs a view inside that reservation without
//!   moving it,
//! - `mprotect(2)` commits and uncommits pages of an anonymous reservation
//!   in place,
//! - remapping a range back to `PROT_NONE` releases a view while keeping
//!   the range reserved.
//!
//! References:
//! - https://man7.org/linux/man-pages/man2/mmap.2.html
//! - https://man7.org/linux/man-pages/man2/madvise.2.html
//! - https://www.kernel.org/doc/html/latest/mm/overcommit-accounting.html

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, warn};

use crate::error::{Error, MappedFileError, MappingError, Result};

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut size = PAGE_SIZE.load(Ordering::Relaxed);
    if size == 0 {
        size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }
    size
}

/// POSIX views may start at any page boundary.
pub(crate) fn allocation_granularity() -> usize {
    page_size()
}

pub(crate) fn round_up_to_page_size(size: usize) -> usize {
    let page_size = page_size();

    (size.saturating_add(page_size - 1) / page_size) * page_size
}

/// A contiguous range of virtual addresses with no accessible pages.
///
/// `PROT_NONE` together with `MAP_NORESERVE` keeps the range out of the
/// kernel's overcommit accounting, so reserving far more than physical
/// memory is fine. Dropping releases the whole range, including any pages a
/// fixed view later reverted to `PROT_NONE`.
pub(crate) struct Reservation {
    base: NonNull<u8>,
    capacity: usize,
}

impl Reservation {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        if capacity > isize::MAX as usize {
            return Err(Error::OutOfMemory);
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MappingError::last_os("mmap").into());
        }

        match NonNull::new(addr.cast::<u8>()) {
            Some(base) => Ok(Self { base, capacity }),
            None => Err(MappingError::last_os("mmap").into()),
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pointer `offset` bytes into the reserved range.
    pub(crate) fn address(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity);
        unsafe { self.base.as_ptr().add(offset) }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.capacity) } != 0 {
            error!(
                error = %MappingError::last_os("munmap"),
                "failed to release an address-space reservation"
            );
        }
    }
}

/// A live mapped view.
///
/// A view created with `MAP_FIXED` lives inside a [`Reservation`]; dropping
/// it reverts the range to `PROT_NONE` rather than unmapping, so the
/// reservation keeps its claim on the addresses. Writable views flush
/// before release.
pub(crate) struct View {
    addr: NonNull<u8>,
    len: usize,
    fixed: bool,
    writable: bool,
}

impl View {
    /// Maps `len` bytes of `fd`. `addr` is null for a kernel-chosen address
    /// or a reservation address combined with `MAP_FIXED`.
    pub(crate) fn map_file(
        addr: *mut libc::c_void,
        len: usize,
        prot: libc::c_int,
        flags: libc::c_int,
        fd: libc::c_int,
    ) -> std::result::Result<Self, MappingError> {
        let mapped = unsafe { libc::mmap(addr, len, prot, flags, fd, 0) };
        if mapped == libc::MAP_FAILED {
            return Err(MappingError::last_os("mmap"));
        }

        match NonNull::new(mapped.cast::<u8>()) {
            Some(addr) => Ok(Self {
                addr,
                len,
                fixed: flags & libc::MAP_FIXED != 0,
                writable: prot & libc::PROT_WRITE != 0,
            }),
            None => Err(MappingError::last_os("mmap")),
        }
    }

    pub(crate) fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Synchronously writes back `[offset, offset + len)`. The caller has
    /// already checked the range against the view length; `msync` only
    /// needs the start rounded down to a page boundary.
    pub(crate) fn flush_range(
        &self,
        offset: usize,
        len: usize,
    ) -> std::result::Result<(), MappingError> {
        if len == 0 {
            return Ok(());
        }

        let aligned = offset & !(page_size() - 1);
        let flush_len = len + (offset - aligned);
        let rc = unsafe {
            libc::msync(
                self.addr.as_ptr().add(aligned).cast(),
                flush_len,
                libc::MS_SYNC | libc::MS_INVALIDATE,
            )
        };
        if rc != 0 {
            return Err(MappingError::last_os("msync"));
        }
        Ok(())
    }
}

impl Drop for View {
    fn drop(&mut self) {
        unsafe {
            if self.writable {
                let rc = libc::msync(
                    self.addr.as_ptr().cast(),
                    self.len,
                    libc::MS_SYNC | libc::MS_INVALIDATE,
                );
                if rc != 0 {
                    warn!(
                        error = %MappingError::last_os("msync"),
                        "flush before unmap failed"
                    );
                }
            }

            if self.fixed {
                // Revert instead of unmapping so the surrounding reservation
                // keeps the address range.
                let addr = libc::mmap(
                    self.addr.as_ptr().cast(),
                    self.len,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                    -1,
                    0,
                );
                if addr == libc::MAP_FAILED {
                    error!(
                        error = %MappingError::last_os("mmap"),
                        "failed to restore a reservation while releasing a view"
                    );
                }
            } else if libc::munmap(self.addr.as_ptr().cast(), self.len) != 0 {
                error!(error = %MappingError::last_os("munmap"), "munmap failed");
            }
        }
    }
}

fn file_len(file: &File, path: &Path) -> Result<u64> {
    Ok(file
        .metadata()
        .map_err(|e| MappedFileError::new(path, e))?
        .len())
}

/// Read-only mapping of a whole file.
pub(crate) struct MappedFile {
    view: Option<View>,
    _file: File,
}

impl MappedFile {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| MappedFileError::new(path, e))?;
        let len = usize::try_from(file_len(&file, path)?).map_err(|_| Error::OutOfMemory)?;

        let view = if len > 0 {
            Some(View::map_file(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
            )?)
        } else {
            None
        };

        Ok(Self { view, _file: file })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.view
            .as_ref()
            .map_or(ptr::null(), |v| v.addr().as_ptr())
    }

    pub(crate) fn len(&self) -> usize {
        self.view.as_ref().map_or(0, View::len)
    }
}

/// Writable shared mapping of a whole existing file.
pub(crate) struct WritableMappedFile {
    view: Option<View>,
    _file: File,
}

impl WritableMappedFile {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| MappedFileError::new(path, e))?;
        let len = usize::try_from(file_len(&file, path)?).map_err(|_| Error::OutOfMemory)?;

        let view = if len > 0 {
            Some(View::map_file(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
            )?)
        } else {
            None
        };

        Ok(Self { view, _file: file })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.view
            .as_ref()
            .map_or(ptr::null(), |v| v.addr().as_ptr())
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.view
            .as_ref()
            .map_or(ptr::null_mut(), |v| v.addr().as_ptr())
    }

    pub(crate) fn len(&self) -> usize {
        self.view.as_ref().map_or(0, View::len)
    }

    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        match &self.view {
            Some(view) => view.flush_range(offset, len).map_err(Error::from),
            None => Ok(()),
        }
    }
}

/// File-backed resizable mapping pinned to a reservation.
///
/// Field order matters: the view must drop before the file and the file
/// before the reservation.
pub(crate) struct ResizableFile {
    view: Option<View>,
    file: File,
    reservation: Reservation,
}

impl ResizableFile {
    pub(crate) fn open(path: &Path, capacity: usize) -> Result<Self> {
        let reservation = Reservation::new(capacity)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| MappedFileError::new(path, e))?;

        let existing = file_len(&file, path)?;
        if existing > capacity as u64 {
            return Err(Error::OutOfMemory);
        }

        let mut mapping = Self {
            view: None,
            file,
            reservation,
        };
        if existing > 0 {
            mapping.map_view(existing as usize)?;
        }
        Ok(mapping)
    }

    fn map_view(&mut self, len: usize) -> Result<()> {
        let view = View::map_file(
            self.reservation.base().as_ptr().cast(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            self.file.as_raw_fd(),
        )?;
        self.view = Some(view);
        Ok(())
    }

    /// Drops the current view, truncates the file, and re-maps at the
    /// reservation base with `MAP_FIXED`. `mremap` could relocate the
    /// mapping, which would break address stability, so the view is torn
    /// down and re-installed instead; the interval with no live view is
    /// private to this exclusive `&mut` call.
    pub(crate) fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.reservation.capacity() {
            return Err(Error::OutOfMemory);
        }

        self.view = None;
        self.file
            .set_len(new_len as u64)
            .map_err(|e| MappingError::new("ftruncate", e))?;
        if new_len > 0 {
            self.map_view(new_len)?;
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.view
            .as_ref()
            .map_or(ptr::null(), |v| v.addr().as_ptr())
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.view
            .as_ref()
            .map_or(ptr::null_mut(), |v| v.addr().as_ptr())
    }

    pub(crate) fn len(&self) -> usize {
        self.view.as_ref().map_or(0, View::len)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.reservation.capacity()
    }

    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        match &self.view {
            Some(view) => view.flush_range(offset, len).map_err(Error::from),
            None => Ok(()),
        }
    }
}

/// Anonymous resizable region: the reservation is the backing store, and
/// commitment is a page-granular `mprotect` of its head.
pub(crate) struct ResizableMemory {
    reservation: Reservation,
    len: usize,
    mapped_len: usize,
}

impl ResizableMemory {
    pub(crate) fn new(initial_len: usize, capacity: usize) -> Result<Self> {
        let reservation = Reservation::new(capacity)?;
        let mut memory = Self {
            reservation,
            len: 0,
            mapped_len: 0,
        };
        memory.resize(initial_len)?;
        Ok(memory)
    }

    pub(crate) fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.reservation.capacity() {
            return Err(Error::OutOfMemory);
        }

        let new_mapped = round_up_to_page_size(new_len);
        if new_mapped > self.mapped_len {
            let rc = unsafe {
                libc::mprotect(
                    self.reservation.address(self.mapped_len).cast(),
                    new_mapped - self.mapped_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc != 0 {
                return Err(MappingError::last_os("mprotect").into());
            }
        } else if new_mapped < self.mapped_len {
            let released = self.mapped_len - new_mapped;
            let addr = self.reservation.address(new_mapped).cast();
            if unsafe { libc::mprotect(addr, released, libc::PROT_NONE) } != 0 {
                return Err(MappingError::last_os("mprotect").into());
            }
            // mprotect alone keeps the physical pages; MADV_DONTNEED hands
            // them back to the OS. Many times faster than remapping.
            if unsafe { libc::madvise(addr, released, libc::MADV_DONTNEED) } != 0 {
                return Err(MappingError::last_os("madvise").into());
            }
        }

        self.mapped_len = new_mapped;
        self.len = new_len;
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        if self.len == 0 {
            ptr::null()
        } else {
            self.reservation.base().as_ptr()
        }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        if self.len == 0 {
            ptr::null_mut()
        } else {
            self.reservation.base().as_ptr()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.reservation.capacity()
    }
}
