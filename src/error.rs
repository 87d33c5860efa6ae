use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything a mapping operation can fail with.
///
/// There are exactly three kinds: an OS-level mapping failure, a file-level
/// failure carrying the path it happened on, and the purely logical
/// [`OutOfMemory`](Error::OutOfMemory) raised when a request does not fit the
/// reserved capacity. Nothing else is ever returned.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS mapping, protection, section, or sync call failed.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// A backing file could not be opened or queried.
    #[error(transparent)]
    MappedFile(#[from] MappedFileError),

    /// The requested size exceeds the reserved capacity, an existing file is
    /// already larger than the requested capacity, or the capacity itself is
    /// beyond the addressable range.
    #[error("requested size exceeds the reserved capacity")]
    OutOfMemory,
}

/// An OS call failed while manipulating a mapping.
///
/// Carries the name of the failing call and the underlying OS error; the OS
/// error code is available through [`MappingError::os_error`].
#[derive(Debug, Error)]
#[error("{call} failed: {source}")]
pub struct MappingError {
    call: &'static str,
    #[source]
    source: io::Error,
}

impl MappingError {
    /// Captures the thread's last OS error for `call`.
    pub(crate) fn last_os(call: &'static str) -> Self {
        Self {
            call,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn new(call: &'static str, source: io::Error) -> Self {
        Self { call, source }
    }

    pub(crate) fn invalid_range(call: &'static str) -> Self {
        Self {
            call,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "range exceeds the mapped length",
            ),
        }
    }

    /// The OS call that failed, e.g. `"mmap"` or `"NtExtendSection"`.
    pub fn call(&self) -> &'static str {
        self.call
    }

    /// The raw OS error code, when the failure came from the OS.
    pub fn os_error(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

/// A backing file could not be opened or queried.
#[derive(Debug, Error)]
#[error("{}: {source}", .path.display())]
pub struct MappedFileError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

impl MappedFileError {
    pub(crate) fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The file the failure occurred on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw OS error code, when the failure came from the OS.
    pub fn os_error(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}
