//! Low-level file-backed shared memory mappings

use crate::error::{ChannelError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate, open, unlink, Mode, OFlags};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A `MAP_SHARED` mapping of a whole backing file
///
/// The mapping is released on drop. The backing file is never removed here;
/// whoever tracks attachment decides when to call [`remove_backing_file`].
pub struct MappedFile {
    addr: NonNull<u8>,
    size: usize,
    path: PathBuf,
}

// SAFETY: MappedFile can be safely shared between threads
// The shared memory region itself is synchronized via atomic operations
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Create a new backing file of `size` bytes and map it.
    ///
    /// Returns `Ok(None)` if the file already exists. A file created here is
    /// removed again if sizing or mapping it fails.
    pub fn create_exclusive(path: &Path, size: usize) -> Result<Option<Self>> {
        let fd = match open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::RWXU,
        ) {
            Ok(fd) => fd,
            Err(e) if e == Errno::EXIST => return Ok(None),
            Err(e) => {
                return Err(ChannelError::Create {
                    path: path.to_path_buf(),
                    source: e.into(),
                })
            }
        };

        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| ChannelError::Truncate(e.into()))
            .and_then(|()| Self::map(&fd, size, path));

        match mapped {
            Ok(region) => {
                // Zero initialize
                unsafe {
                    std::ptr::write_bytes(region.as_ptr(), 0, size);
                }
                Ok(Some(region))
            }
            Err(e) => {
                let _ = unlink(path);
                Err(e)
            }
        }
    }

    /// Open and map an existing backing file in full.
    ///
    /// Files shorter than `min_size` are rejected as corrupt without mapping.
    pub fn open(path: &Path, min_size: usize) -> Result<Self> {
        let fd = open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()).map_err(|e| {
            ChannelError::Open {
                path: path.to_path_buf(),
                source: e.into(),
            }
        })?;

        // Get size from file
        let stat = fstat(&fd).map_err(|e| ChannelError::Open {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;

        if size < min_size {
            return Err(ChannelError::Corrupt {
                path: path.to_path_buf(),
                len: size,
                expected: min_size,
            });
        }

        Self::map(&fd, size, path)
    }

    fn map(fd: &OwnedFd, size: usize, path: &Path) -> Result<Self> {
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(|e| ChannelError::Mmap(e.into()))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            ChannelError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })?;

        Ok(Self {
            addr,
            size,
            path: path.to_path_buf(),
        })
    }

    /// Get raw pointer to the mapping
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the backing file path
    #[inline(always)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

/// Unlink a backing file, treating an already-missing file as success
pub fn remove_backing_file(path: &Path) -> std::io::Result<()> {
    match unlink(path) {
        Ok(()) => Ok(()),
        Err(e) if e == Errno::NOENT => Ok(()),
        Err(e) => Err(e.into()),
    }
}
