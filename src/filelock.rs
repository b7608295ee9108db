//! Advisory cross-process file lock
//!
//! A held [`FileLock`] is an exclusive `flock(2)` on a well-known file. It
//! blocks until acquired and is released when dropped. Every participant must
//! take it around segment creation and open, nothing enforces that.

use crate::error::{ChannelError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{flock, open, FlockOperation, Mode, OFlags};
use std::path::{Path, PathBuf};

/// Scoped exclusive lock on a file
pub struct FileLock {
    fd: OwnedFd,
    path: PathBuf,
}

impl FileLock {
    /// Open (creating if needed) the lock file and block until it is ours
    pub fn acquire(path: &Path) -> Result<Self> {
        let fd = open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
            Mode::RWXU,
        )
        .map_err(|e| ChannelError::Lock {
            path: path.to_path_buf(),
            source: e.into(),
        })?;

        flock(&fd, FlockOperation::LockExclusive).map_err(|e| ChannelError::Lock {
            path: path.to_path_buf(),
            source: e.into(),
        })?;

        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock too; unlock explicitly so
        // a dup'd descriptor elsewhere can't keep it alive.
        let _ = flock(&self.fd, FlockOperation::Unlock);
    }
}
