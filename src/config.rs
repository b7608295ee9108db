//! Channel configuration and name resolution

use crate::error::{ChannelError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// File stub for backing files; the channel name is appended verbatim
pub const BLOCK_STUB: &str = "/dev/shm/auv_visiond_";

/// Lock file serializing every create/open on this host
pub const GLOBAL_LOCK: &str = "/dev/shm/auv_visiond.lock";

/// How long a blocking consume sleeps before reporting no new frame
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest filename most filesystems accept
const MAX_FILENAME_LEN: usize = 255;

/// Channel configuration
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Path prefix that channel names are appended to
    pub block_stub: String,
    /// Advisory lock file guarding create, open and final detach
    pub lock_path: PathBuf,
    /// Upper bound on a blocking consume
    pub wait_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            block_stub: BLOCK_STUB.to_string(),
            lock_path: PathBuf::from(GLOBAL_LOCK),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    /// Resolve a channel name to its backing file.
    ///
    /// `/` is the only byte besides NUL that Linux forbids in a filename,
    /// so both are rejected here before any I/O happens.
    pub fn segment_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(ChannelError::InvalidName {
                name: name.to_string(),
                reason: "name is empty",
            });
        }
        if name.contains('/') {
            return Err(ChannelError::InvalidName {
                name: name.to_string(),
                reason: "name contains '/'",
            });
        }
        if name.contains('\0') {
            return Err(ChannelError::InvalidName {
                name: name.to_string(),
                reason: "name contains NUL",
            });
        }

        let file_prefix = self.block_stub.rsplit('/').next().unwrap_or("");
        let max = MAX_FILENAME_LEN.saturating_sub(file_prefix.len());
        if name.len() > max {
            return Err(ChannelError::NameTooLong {
                max,
                got: name.len(),
            });
        }

        Ok(PathBuf::from(format!("{}{}", self.block_stub, name)))
    }
}
