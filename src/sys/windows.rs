//! Windows back-end.
//!
//! The whole-file path uses the documented `CreateFileMappingW` /
//! `MapViewOfFile` pair. The resizable file path needs a section that can
//! grow underneath a live view, which only the `ntdll` section API offers:
//! a `SEC_COMMIT` section created with `SECTION_EXTEND_SIZE` is mapped once
//! with `ViewSize` equal to the full capacity and `MEM_RESERVE`, leaving
//! the tail beyond the current size reserved; `NtExtendSection` then flips
//! reserved pages to committed in place, so the view base never moves.
//!
//! `win32` quick reference:
//!
//! - https://docs.rs/windows-sys/latest/windows_sys/index.html
//! - https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/
//! - https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-createfilemappingw
//! - https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/ntifs/nf-ntifs-ntcreatesection
//! - https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree

use std::ffi::c_void;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use tracing::{error, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE, HMODULE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, GetFileSizeEx, SetEndOfFile, SetFilePointerEx,
    FILE_ATTRIBUTE_NORMAL, FILE_BEGIN, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FlushViewOfFile, MapViewOfFile, UnmapViewOfFile, VirtualAlloc,
    VirtualFree, FILE_MAP_READ, FILE_MAP_WRITE, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
    MEM_RESERVE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE, SEC_COMMIT,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use crate::error::{Error, MappedFileError, MappingError, Result};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info = MaybeUninit::<SYSTEM_INFO>::uninit();
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    }
}

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicU32 = AtomicU32::new(0);

    let mut size = PAGE_SIZE.load(Ordering::Relaxed);
    if size == 0 {
        // dwAllocationGranularity constrains view bases; dwPageSize is the
        // commit/protection granularity, which is what resize rounds to.
        size = system_info().dwPageSize;
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }
    size as usize
}

/// Minimum alignment of a view base; coarser than the page size.
pub(crate) fn allocation_granularity() -> usize {
    static GRANULARITY: AtomicU32 = AtomicU32::new(0);

    let mut granularity = GRANULARITY.load(Ordering::Relaxed);
    if granularity == 0 {
        granularity = system_info().dwAllocationGranularity;
        GRANULARITY.store(granularity, Ordering::Relaxed);
    }
    granularity as usize
}

pub(crate) fn round_up_to_page_size(size: usize) -> usize {
    let page_size = page_size();

    (size.saturating_add(page_size - 1) / page_size) * page_size
}

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(Some(0)).collect()
}

fn wide_path(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

// The section API lives in ntdll and is not part of the documented Win32
// surface, so the entry points are resolved from the loaded module once.

type NtStatus = i32;

const STATUS_SUCCESS: NtStatus = 0;

const SECTION_MAP_WRITE: u32 = 0x0002;
const SECTION_MAP_READ: u32 = 0x0004;
const SECTION_EXTEND_SIZE: u32 = 0x0010;

/// `SECTION_INHERIT::ViewUnmap`: child processes do not inherit the view.
const VIEW_UNMAP: u32 = 2;

type NtCreateSectionFn = unsafe extern "system" fn(
    section_handle: *mut HANDLE,
    desired_access: u32,
    object_attributes: *mut c_void,
    maximum_size: *mut i64,
    section_page_protection: u32,
    allocation_attributes: u32,
    file_handle: HANDLE,
) -> NtStatus;

type NtExtendSectionFn =
    unsafe extern "system" fn(section_handle: HANDLE, new_section_size: *mut i64) -> NtStatus;

type NtMapViewOfSectionFn = unsafe extern "system" fn(
    section_handle: HANDLE,
    process_handle: HANDLE,
    base_address: *mut *mut c_void,
    zero_bits: usize,
    commit_size: usize,
    section_offset: *mut i64,
    view_size: *mut usize,
    inherit_disposition: u32,
    allocation_type: u32,
    win32_protect: u32,
) -> NtStatus;

type NtUnmapViewOfSectionFn =
    unsafe extern "system" fn(process_handle: HANDLE, base_address: *mut c_void) -> NtStatus;

type RtlNtStatusToDosErrorFn = unsafe extern "system" fn(status: NtStatus) -> u32;

struct Ntdll {
    create_section: NtCreateSectionFn,
    extend_section: NtExtendSectionFn,
    map_view_of_section: NtMapViewOfSectionFn,
    unmap_view_of_section: NtUnmapViewOfSectionFn,
    status_to_dos_error: RtlNtStatusToDosErrorFn,
}

impl Ntdll {
    fn load() -> std::result::Result<Self, MappingError> {
        unsafe {
            let ntdll = GetModuleHandleW(wide("ntdll.dll").as_ptr());
            if ntdll == 0 {
                return Err(MappingError::last_os("GetModuleHandleW"));
            }
            Ok(Self {
                create_section: mem::transmute(export(ntdll, b"NtCreateSection\0")?),
                extend_section: mem::transmute(export(ntdll, b"NtExtendSection\0")?),
                map_view_of_section: mem::transmute(export(ntdll, b"NtMapViewOfSection\0")?),
                unmap_view_of_section: mem::transmute(export(ntdll, b"NtUnmapViewOfSection\0")?),
                status_to_dos_error: mem::transmute(export(ntdll, b"RtlNtStatusToDosError\0")?),
            })
        }
    }
}

unsafe fn export(
    module: HMODULE,
    name: &[u8],
) -> std::result::Result<unsafe extern "system" fn() -> isize, MappingError> {
    match GetProcAddress(module, name.as_ptr()) {
        Some(address) => Ok(address),
        None => Err(MappingError::last_os("GetProcAddress")),
    }
}

lazy_static! {
    static ref NTDLL: std::result::Result<Ntdll, MappingError> = Ntdll::load();
}

/// The memoized section API, or the error the one-time load produced. The
/// stored error cannot move out of the static, so an equal one is minted
/// per caller.
fn ntdll() -> std::result::Result<&'static Ntdll, MappingError> {
    match &*NTDLL {
        Ok(table) => Ok(table),
        Err(e) => Err(MappingError::new(
            e.call(),
            e.os_error().map_or_else(
                || io::Error::new(io::ErrorKind::Unsupported, "ntdll section API unavailable"),
                io::Error::from_raw_os_error,
            ),
        )),
    }
}

fn nt_error(table: &Ntdll, call: &'static str, status: NtStatus) -> MappingError {
    let code = unsafe { (table.status_to_dos_error)(status) };
    MappingError::new(call, io::Error::from_raw_os_error(code as i32))
}

/// Owning wrapper over a kernel handle; closed on drop, never copied.
struct Handle(HANDLE);

impl Handle {
    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.0 != 0 && self.0 != INVALID_HANDLE_VALUE {
            if unsafe { CloseHandle(self.0) } == 0 {
                error!(error = %MappingError::last_os("CloseHandle"), "failed to close a handle");
            }
        }
    }
}

/// Open file, with the size and truncate calls the mappings need.
pub(crate) struct FileHandle {
    handle: Handle,
}

impl FileHandle {
    fn open(
        path: &Path,
        access: u32,
        share: u32,
        disposition: u32,
    ) -> std::result::Result<Self, MappedFileError> {
        let name = wide_path(path);
        let handle = unsafe {
            CreateFileW(
                name.as_ptr(),
                access,
                share,
                ptr::null(),
                disposition,
                FILE_ATTRIBUTE_NORMAL,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(MappedFileError::new(path, io::Error::last_os_error()));
        }
        Ok(Self {
            handle: Handle(handle),
        })
    }

    fn raw(&self) -> HANDLE {
        self.handle.raw()
    }

    fn len(&self) -> std::result::Result<u64, MappingError> {
        let mut size = 0i64;
        if unsafe { GetFileSizeEx(self.raw(), &mut size) } == 0 {
            return Err(MappingError::last_os("GetFileSizeEx"));
        }
        Ok(size as u64)
    }

    fn truncate(&self, len: u64) -> std::result::Result<(), MappingError> {
        unsafe {
            if SetFilePointerEx(self.raw(), len as i64, ptr::null_mut(), FILE_BEGIN) == 0 {
                return Err(MappingError::last_os("SetFilePointerEx"));
            }
            if SetEndOfFile(self.raw()) == 0 {
                return Err(MappingError::last_os("SetEndOfFile"));
            }
        }
        Ok(())
    }

    fn flush(&self) -> std::result::Result<(), MappingError> {
        if unsafe { FlushFileBuffers(self.raw()) } == 0 {
            return Err(MappingError::last_os("FlushFileBuffers"));
        }
        Ok(())
    }
}

/// File-mapping object sized to the file at creation time.
struct FileMapping {
    handle: Handle,
}

impl FileMapping {
    fn new(file: &FileHandle, protect: u32) -> std::result::Result<Self, MappingError> {
        // Zero maximum size takes the current file size.
        let handle =
            unsafe { CreateFileMappingW(file.raw(), ptr::null(), protect, 0, 0, ptr::null()) };
        if handle == 0 {
            return Err(MappingError::last_os("CreateFileMappingW"));
        }
        Ok(Self {
            handle: Handle(handle),
        })
    }
}

/// View mapped through the documented Win32 API.
struct ViewHandle {
    addr: NonNull<c_void>,
    writable: bool,
}

impl ViewHandle {
    fn map(
        mapping: &FileMapping,
        access: u32,
        writable: bool,
    ) -> std::result::Result<Self, MappingError> {
        // Zero length maps the mapping object's full extent.
        let addr = unsafe { MapViewOfFile(mapping.handle.raw(), access, 0, 0, 0) };
        match NonNull::new(addr) {
            Some(addr) => Ok(Self { addr, writable }),
            None => Err(MappingError::last_os("MapViewOfFile")),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr().cast()
    }

    fn flush_range(&self, offset: usize, len: usize) -> std::result::Result<(), MappingError> {
        flush_view(self.addr.as_ptr(), offset, len)
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        if self.writable {
            if unsafe { FlushViewOfFile(self.addr.as_ptr(), 0) } == 0 {
                warn!(
                    error = %MappingError::last_os("FlushViewOfFile"),
                    "flush before unmap failed"
                );
            }
        }
        if unsafe { UnmapViewOfFile(self.addr.as_ptr()) } == 0 {
            error!(error = %MappingError::last_os("UnmapViewOfFile"), "UnmapViewOfFile failed");
        }
    }
}

/// Flushes `[offset, offset + len)` of a view; the start only needs to be
/// rounded down to a page boundary.
fn flush_view(
    base: *mut c_void,
    offset: usize,
    len: usize,
) -> std::result::Result<(), MappingError> {
    if len == 0 {
        return Ok(());
    }

    let aligned = offset & !(page_size() - 1);
    let flush_len = len + (offset - aligned);
    let start = unsafe { base.cast::<u8>().add(aligned) };
    if unsafe { FlushViewOfFile(start as *const c_void, flush_len) } == 0 {
        return Err(MappingError::last_os("FlushViewOfFile"));
    }
    Ok(())
}

/// Read-only mapping of a whole file.
pub(crate) struct MappedFile {
    view: Option<ViewHandle>,
    _mapping: Option<FileMapping>,
    _file: FileHandle,
    len: usize,
}

impl MappedFile {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = FileHandle::open(path, GENERIC_READ, FILE_SHARE_READ, OPEN_EXISTING)?;
        let len = usize::try_from(file.len()?).map_err(|_| Error::OutOfMemory)?;

        let (mapping, view) = if len > 0 {
            let mapping = FileMapping::new(&file, PAGE_READONLY)?;
            let view = ViewHandle::map(&mapping, FILE_MAP_READ, false)?;
            (Some(mapping), Some(view))
        } else {
            (None, None)
        };

        Ok(Self {
            view,
            _mapping: mapping,
            _file: file,
            len,
        })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.view.as_ref().map_or(ptr::null(), ViewHandle::as_ptr)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Writable shared mapping of a whole existing file.
pub(crate) struct WritableMappedFile {
    view: Option<ViewHandle>,
    _mapping: Option<FileMapping>,
    file: FileHandle,
    len: usize,
}

impl WritableMappedFile {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = FileHandle::open(
            path,
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            OPEN_EXISTING,
        )?;
        let len = usize::try_from(file.len()?).map_err(|_| Error::OutOfMemory)?;

        let (mapping, view) = if len > 0 {
            let mapping = FileMapping::new(&file, PAGE_READWRITE)?;
            let view = ViewHandle::map(&mapping, FILE_MAP_WRITE, true)?;
            (Some(mapping), Some(view))
        } else {
            (None, None)
        };

        Ok(Self {
            view,
            _mapping: mapping,
            file,
            len,
        })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.view.as_ref().map_or(ptr::null(), ViewHandle::as_ptr)
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.view
            .as_ref()
            .map_or(ptr::null_mut(), ViewHandle::as_ptr)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if let Some(view) = &self.view {
            view.flush_range(offset, len)?;
            // FlushViewOfFile queues the dirty pages; FlushFileBuffers makes
            // the write durable.
            self.file.flush()?;
        }
        Ok(())
    }
}

/// Section created through ntdll so it can later be extended in place.
struct Section {
    handle: Handle,
    len: usize,
}

impl Section {
    fn create(file: &FileHandle, len: usize) -> std::result::Result<Self, MappingError> {
        let table = ntdll()?;
        let mut handle: HANDLE = 0;
        let mut maximum = len as i64;
        let status = unsafe {
            (table.create_section)(
                &mut handle,
                SECTION_MAP_READ | SECTION_MAP_WRITE | SECTION_EXTEND_SIZE,
                ptr::null_mut(),
                &mut maximum,
                PAGE_READWRITE,
                SEC_COMMIT,
                file.raw(),
            )
        };
        if status != STATUS_SUCCESS {
            return Err(nt_error(table, "NtCreateSection", status));
        }
        Ok(Self {
            handle: Handle(handle),
            len,
        })
    }

    /// Grows the section (and with `SECTION_EXTEND_SIZE`, the backing file)
    /// to `len` bytes. Committed pages appear under every live view.
    fn extend(&mut self, len: usize) -> std::result::Result<(), MappingError> {
        let table = ntdll()?;
        let mut new_size = len as i64;
        let status = unsafe { (table.extend_section)(self.handle.raw(), &mut new_size) };
        if status != STATUS_SUCCESS {
            return Err(nt_error(table, "NtExtendSection", status));
        }
        self.len = len;
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// View of a section covering the full reserved capacity.
///
/// Pages past the section's current size stay `MEM_RESERVE` until the
/// section grows under them, which is what keeps the base stable across
/// grows.
struct SectionView {
    addr: NonNull<c_void>,
}

impl SectionView {
    fn map(
        section: &Section,
        requested_base: Option<NonNull<c_void>>,
        view_size: usize,
    ) -> std::result::Result<Self, MappingError> {
        let table = ntdll()?;
        let mut base = requested_base.map_or(ptr::null_mut(), NonNull::as_ptr);
        let mut view_size = view_size;
        let mut offset = 0i64;
        let status = unsafe {
            (table.map_view_of_section)(
                section.handle.raw(),
                GetCurrentProcess(),
                &mut base,
                0,
                0,
                &mut offset,
                &mut view_size,
                VIEW_UNMAP,
                MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if status != STATUS_SUCCESS {
            return Err(nt_error(table, "NtMapViewOfSection", status));
        }
        match NonNull::new(base) {
            Some(addr) => Ok(Self { addr }),
            None => Err(nt_error(table, "NtMapViewOfSection", status)),
        }
    }

    fn addr(&self) -> NonNull<c_void> {
        self.addr
    }

    fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr().cast()
    }

    fn flush_range(&self, offset: usize, len: usize) -> std::result::Result<(), MappingError> {
        flush_view(self.addr.as_ptr(), offset, len)
    }
}

impl Drop for SectionView {
    fn drop(&mut self) {
        if unsafe { FlushViewOfFile(self.addr.as_ptr(), 0) } == 0 {
            warn!(
                error = %MappingError::last_os("FlushViewOfFile"),
                "flush before unmap failed"
            );
        }
        // A live view proves the table loaded, so the error arm is
        // unreachable in practice; drop must not unwind either way.
        match ntdll() {
            Ok(table) => {
                let status = unsafe {
                    (table.unmap_view_of_section)(GetCurrentProcess(), self.addr.as_ptr())
                };
                if status != STATUS_SUCCESS {
                    error!(
                        error = %nt_error(table, "NtUnmapViewOfSection", status),
                        "NtUnmapViewOfSection failed"
                    );
                }
            }
            Err(e) => error!(error = %e, "section API unavailable while releasing a view"),
        }
    }
}

/// File-backed resizable mapping.
///
/// The first grow creates the section and its full-capacity view; later
/// grows extend the section in place. Field order matters: the view must
/// drop before the section and the section before the file.
pub(crate) struct ResizableFile {
    view: Option<SectionView>,
    section: Option<Section>,
    file: FileHandle,
    capacity: usize,
}

impl ResizableFile {
    pub(crate) fn open(path: &Path, capacity: usize) -> Result<Self> {
        if capacity > isize::MAX as usize {
            return Err(Error::OutOfMemory);
        }

        let file = FileHandle::open(
            path,
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            OPEN_ALWAYS,
        )?;

        let existing = file.len()?;
        if existing > capacity as u64 {
            return Err(Error::OutOfMemory);
        }

        let mut mapping = Self {
            view: None,
            section: None,
            file,
            capacity,
        };
        if existing > 0 {
            mapping.map_section(existing as usize, None)?;
        }
        Ok(mapping)
    }

    fn map_section(&mut self, len: usize, base: Option<NonNull<c_void>>) -> Result<()> {
        let section = Section::create(&self.file, len)?;
        let view = SectionView::map(&section, base, self.capacity)?;
        self.section = Some(section);
        self.view = Some(view);
        Ok(())
    }

    /// Grows extend the section in place. A section cannot shrink, and a
    /// file with a live user-mapped section cannot be truncated, so shrinks
    /// tear both down, truncate, and rebuild at the recorded base; the
    /// range was just freed and this object owns it exclusively, so the
    /// requested base is honored.
    pub(crate) fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.capacity {
            return Err(Error::OutOfMemory);
        }

        if let Some(section) = self.section.as_mut() {
            if new_len >= section.len() {
                if new_len > section.len() {
                    section.extend(new_len)?;
                }
            } else {
                let base = self.view.as_ref().map(SectionView::addr);
                self.view = None;
                self.section = None;
                self.file.truncate(new_len as u64)?;
                if new_len > 0 {
                    self.map_section(new_len, base)?;
                }
            }
        } else if new_len > 0 {
            self.map_section(new_len, None)?;
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.view.as_ref().map_or(ptr::null(), SectionView::as_ptr)
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.view
            .as_ref()
            .map_or(ptr::null_mut(), SectionView::as_ptr)
    }

    pub(crate) fn len(&self) -> usize {
        self.section.as_ref().map_or(0, Section::len)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if let Some(view) = &self.view {
            view.flush_range(offset, len)?;
            self.file.flush()?;
        }
        Ok(())
    }
}

/// A contiguous range of virtual addresses with no accessible pages.
pub(crate) struct Reservation {
    base: NonNull<u8>,
    capacity: usize,
}

impl Reservation {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        if capacity > isize::MAX as usize {
            return Err(Error::OutOfMemory);
        }

        let addr = unsafe { VirtualAlloc(ptr::null(), capacity, MEM_RESERVE, PAGE_NOACCESS) };
        match NonNull::new(addr.cast::<u8>()) {
            Some(base) => Ok(Self { base, capacity }),
            None => Err(MappingError::last_os("VirtualAlloc").into()),
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn address(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity);
        unsafe { self.base.as_ptr().add(offset) }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // MEM_RELEASE with size zero frees the whole allocation, committed
        // pages included.
        if unsafe { VirtualFree(self.base.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
            error!(
                error = %MappingError::last_os("VirtualFree"),
                "failed to release an address-space reservation"
            );
        }
    }
}

/// Anonymous resizable region backed by committed pages of a reservation.
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
            let committed = unsafe {
                VirtualAlloc(
                    self.reservation.address(self.mapped_len) as *const c_void,
                    new_mapped - self.mapped_len,
                    MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if committed.is_null() {
                return Err(MappingError::last_os("VirtualAlloc").into());
            }
        } else if new_mapped < self.mapped_len {
            let released = self.mapped_len - new_mapped;
            let addr = self.reservation.address(new_mapped).cast();
            if unsafe { VirtualFree(addr, released, MEM_DECOMMIT) } == 0 {
                return Err(MappingError::last_os("VirtualFree").into());
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

#[cfg(test)]
mod tests {
    use windows_sys::Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_MAPPED};

    use super::*;

    fn query(addr: *const u8) -> MEMORY_BASIC_INFORMATION {
        unsafe {
            let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
            let written = VirtualQuery(
                addr.cast(),
                info.as_mut_ptr(),
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            assert_ne!(written, 0);
            info.assume_init()
        }
    }

    #[test]
    fn allocation_granularity_sanity() {
        assert!(allocation_granularity() >= 4096);
        assert!(allocation_granularity() % page_size() == 0);
    }

    #[test]
    fn section_grow_commits_reserved_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("section.dat");

        let file = FileHandle::open(
            &path,
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            OPEN_ALWAYS,
        )
        .unwrap();

        let mut section = Section::create(&file, 4).unwrap();
        assert_eq!(file.len().unwrap(), 4);

        let view = SectionView::map(&section, None, 1024 * 1024).unwrap();
        let base = view.as_ptr();
        assert_eq!(query(base).State, MEM_COMMIT);
        assert_eq!(query(base).Type, MEM_MAPPED);
        // The tail past the section's size is reserved, not committed.
        let tail = unsafe { base.add(page_size()) };
        assert_eq!(query(tail).State, MEM_RESERVE);

        unsafe { base.cast::<u32>().write(42) };

        let new_len = page_size() * 2 + 31;
        section.extend(new_len).unwrap();
        assert_eq!(file.len().unwrap(), new_len as u64);
        assert_eq!(query(tail).State, MEM_COMMIT);

        assert_eq!(unsafe { base.cast::<u32>().read() }, 42);
        unsafe { base.add(new_len - 1).write(b'M') };
    }

    #[test]
    fn reservation_commit_and_decommit() {
        let page = page_size();
        let mut memory = ResizableMemory::new(page, page * 16).unwrap();
        let base = memory.as_mut_ptr();
        assert_eq!(query(base).State, MEM_COMMIT);

        unsafe { base.write(0xAB) };
        memory.resize(0).unwrap();
        assert_eq!(query(memory.reservation.base().as_ptr()).State, MEM_RESERVE);
    }
}
