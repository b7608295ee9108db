//! frame_channel - Shared memory frame channels
//!
//! Moves fixed-maximum-size binary frames (camera images, typically) from one
//! publishing process to any number of consuming processes on the same host
//! through a memory-mapped file.
//!
//! # Architecture
//!
//! - **Single Writer**: writes into a ring of `BUFFER_CNT` slots, never blocks
//! - **Multiple Readers**: copy the newest slot out under a per-slot SeqLock,
//!   optionally sleeping on a process-shared condition variable first
//! - **Lifecycle**: a global advisory file lock serializes create/open, and a
//!   reference count in the segment decides when the backing file goes away
//!
//! Slow readers skip frames; nothing reports it.

pub mod error;
pub mod config;
pub mod filelock;
pub mod shm;
pub mod seqlock;
pub mod signal;
pub mod layout;
pub mod frame;
pub mod channel;
pub mod registry;
pub mod bindings;

pub use error::{ChannelError, Result};
pub use config::ChannelConfig;
pub use channel::{Channel, Status, FRAMEWORK_DELETED, NO_NEW_FRAME, SUCCESS};
pub use frame::{Frame, FrameShape};
pub use layout::BUFFER_CNT;
pub use registry::ChannelRegistry;
