//! Error types for frame channels

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for frame channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur in frame channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Channel name cannot be mapped to a backing file
    #[error("Invalid channel name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Channel name too long for the backing filesystem
    #[error("Channel name too long: max {max} bytes, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Failed to create the backing file
    #[error("Failed to create backing file '{}': {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to open the backing file
    #[error("Failed to open backing file '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The channel was never created
    #[error("Channel '{name}' does not exist at '{}'", path.display())]
    NotFound { name: String, path: PathBuf },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate the backing file
    #[error("Failed to set backing file size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to take the advisory lock
    #[error("Failed to acquire lock '{}': {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid segment magic number
    #[error("Invalid segment magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Backing file length disagrees with its header
    #[error("Corrupt segment '{}': {len} bytes, expected {expected}", path.display())]
    Corrupt {
        path: PathBuf,
        len: usize,
        expected: usize,
    },

    /// Existing channel was created with a different entry size
    #[error("Opened existing channel '{name}' and got size mismatch: {requested} != {existing} bytes")]
    SizeMismatch {
        name: String,
        requested: usize,
        existing: usize,
    },

    /// Frame does not fit in a slot
    #[error("Cannot write {got} bytes to channel with maximum size of {max} bytes")]
    FrameTooLarge { max: usize, got: usize },

    /// Frame buffer shorter than its declared shape
    #[error("Frame data too short: shape needs {expected} bytes, got {got}")]
    ShortFrameData { expected: usize, got: usize },

    /// The registry already holds this name with another entry size
    #[error("Duplicate allocation of '{name}': registered with {existing} bytes, requested {requested}")]
    AlreadyRegistered {
        name: String,
        existing: usize,
        requested: usize,
    },

    /// The process-shared mutex could not be locked or recovered
    #[error("Coordination primitive failure: {0}")]
    Coordination(#[source] io::Error),
}
