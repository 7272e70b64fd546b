//! OS-specific file allocation primitives.
//!
//! The rest of the workspace only needs one thing from this crate: a way to
//! reserve `len` bytes of real (non-sparse) disk space for a file, using
//! whatever syscall the platform offers. Everything else about file
//! allocation (the `none`/`trunc`/`prealloc` strategies) is plain
//! `std`/`tokio` and lives in `paradl-storage`.

use std::fs::File;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("fallocate is not supported on this platform")]
    Unsupported,
    #[error("fallocate failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Requests that the filesystem allocate `len` bytes for `file` without
/// writing zeros (unlike `prealloc`, which writes explicit zero buffers).
///
/// On unix this calls `posix_fallocate`. There is no portable equivalent on
/// other targets, so callers should fall back to a plain `set_len` (the
/// `trunc` strategy) when this returns `PlatformError::Unsupported`.
pub fn fallocate(file: &File, len: u64) -> Result<(), PlatformError> {
    imp::fallocate(file, len)
}

#[cfg(unix)]
mod imp {
    use super::{File, PlatformError};
    use std::os::unix::io::AsRawFd;

    pub fn fallocate(file: &File, len: u64) -> Result<(), PlatformError> {
        let fd = file.as_raw_fd();
        // posix_fallocate returns the error number directly rather than
        // setting errno; 0 means success.
        let ret = unsafe { libc::posix_fallocate(fd, 0, len as libc::off_t) };
        if ret == 0 {
            Ok(())
        } else {
            Err(PlatformError::Io(std::io::Error::from_raw_os_error(ret)))
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::{File, PlatformError};

    pub fn fallocate(_file: &File, _len: u64) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }
}
