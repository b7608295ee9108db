//! Frame channel handles
//!
//! A [`Channel`] is one process's attachment to a named segment. Any handle
//! can publish or consume, but a channel supports a single publisher at a
//! time; keeping it that way is up to the caller.

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::filelock::FileLock;
use crate::frame::{Frame, FrameShape};
use crate::layout::{header_size, segment_size, Segment, SlotIndex, BUFFER_CNT};
use crate::shm::{remove_backing_file, MappedFile};
use crate::signal::LockState;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Read or write succeeded
pub const SUCCESS: i32 = 0;

/// No frame newer than the caller's last one
pub const NO_NEW_FRAME: i32 = 1;

/// The channel was torn down by its creator and should not be used
pub const FRAMEWORK_DELETED: i32 = 2;

/// Outcome of a publish or consume that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    NoNewFrame,
    Deleted,
}

impl Status {
    /// Numeric status code shared with foreign callers
    pub const fn code(self) -> i32 {
        match self {
            Status::Success => SUCCESS,
            Status::NoNewFrame => NO_NEW_FRAME,
            Status::Deleted => FRAMEWORK_DELETED,
        }
    }
}

/// One attachment to a shared frame channel
///
/// Dropping the handle detaches it: the creator marks the channel deleted,
/// the cross-process reference count goes down, the last handle removes the
/// backing file, and the mapping is released.
pub struct Channel {
    name: String,
    is_creator: bool,
    lock_path: PathBuf,
    wait_timeout: Duration,
    segment: Segment,
}

impl Channel {
    /// Create the channel, or open it if it already exists, with the default configuration
    pub fn create_or_open(name: &str, max_entry_size_bytes: usize) -> Result<Self> {
        Self::create_or_open_with(name, max_entry_size_bytes, &ChannelConfig::default())
    }

    /// Create the channel, or open it if it already exists.
    ///
    /// An existing channel must have been created with the same
    /// `max_entry_size_bytes`. On a mismatch the backing file is removed if
    /// no handle is attached to it, and the call fails either way.
    pub fn create_or_open_with(
        name: &str,
        max_entry_size_bytes: usize,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let path = config.segment_path(name)?;
        let total_size = segment_size(max_entry_size_bytes).ok_or(ChannelError::FrameTooLarge {
            max: (usize::MAX - header_size()) / BUFFER_CNT,
            got: max_entry_size_bytes,
        })?;

        let _lock = FileLock::acquire(&config.lock_path)?;

        let (segment, created) = match Self::create_segment(&path, total_size, max_entry_size_bytes)? {
            Some(segment) => (segment, true),
            None => match Self::attach_segment(&path) {
                Ok(segment) => (segment, false),
                Err(e) if is_unfinished(&e) => {
                    // Creation always completes under the global lock, so this
                    // file was left behind by a creator that died midway
                    warn!(path = %path.display(), error = %e, "removing unfinished channel");
                    remove_backing_file(&path).map_err(|source| ChannelError::Create {
                        path: path.clone(),
                        source,
                    })?;
                    match Self::create_segment(&path, total_size, max_entry_size_bytes)? {
                        Some(segment) => (segment, true),
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            },
        };

        if segment.max_entry_size() != max_entry_size_bytes {
            let attached = segment.header().reference_count();
            if attached == 0 {
                warn!(
                    path = %path.display(),
                    existing = segment.max_entry_size(),
                    requested = max_entry_size_bytes,
                    "removing unattached channel with mismatched entry size"
                );
                if let Err(e) = remove_backing_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove backing file");
                }
            }
            return Err(ChannelError::SizeMismatch {
                name: name.to_string(),
                requested: max_entry_size_bytes,
                existing: segment.max_entry_size(),
            });
        }

        if !created {
            segment.check_length()?;
        }

        // Only count the handle once it is known to be good
        let attached = segment.header().attach_ref();

        if created {
            info!(path = %path.display(), size = segment.size(), "Created channel");
        } else {
            info!(path = %path.display(), size = segment.size(), attached, "Opened channel");
        }

        Ok(Self {
            name: name.to_string(),
            is_creator: created,
            lock_path: config.lock_path.clone(),
            wait_timeout: config.wait_timeout,
            segment,
        })
    }

    /// Create and lay out a new segment; `None` if the file already exists
    fn create_segment(path: &Path, total_size: usize, max_entry_size_bytes: usize) -> Result<Option<Segment>> {
        let Some(region) = MappedFile::create_exclusive(path, total_size)? else {
            return Ok(None);
        };
        match Segment::initialize(region, max_entry_size_bytes) {
            Ok(segment) => Ok(Some(segment)),
            Err(e) => {
                let _ = remove_backing_file(path);
                Err(e)
            }
        }
    }

    fn attach_segment(path: &Path) -> Result<Segment> {
        Segment::attach(MappedFile::open(path, header_size())?)
    }

    /// Open a channel that must already exist, with the default configuration
    pub fn open_existing(name: &str) -> Result<Self> {
        Self::open_existing_with(name, &ChannelConfig::default())
    }

    /// Open a channel that must already exist.
    ///
    /// Fails with [`ChannelError::NotFound`] if nobody created it.
    pub fn open_existing_with(name: &str, config: &ChannelConfig) -> Result<Self> {
        let path = config.segment_path(name)?;
        let _lock = FileLock::acquire(&config.lock_path)?;

        let segment = match Self::attach_segment(&path) {
            Err(ChannelError::Open { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Err(ChannelError::NotFound {
                    name: name.to_string(),
                    path,
                })
            }
            other => other?,
        };
        segment.check_length()?;

        let attached = segment.header().attach_ref();
        info!(path = %path.display(), size = segment.size(), attached, "Opened channel");

        Ok(Self {
            name: name.to_string(),
            is_creator: false,
            lock_path: config.lock_path.clone(),
            wait_timeout: config.wait_timeout,
            segment,
        })
    }

    /// Write one frame and wake every waiting consumer.
    ///
    /// `data` must hold at least `shape.byte_len()` bytes; only that many are
    /// copied. Frames larger than the channel's entry size are a
    /// configuration bug and fail without touching the ring.
    pub fn publish(&self, acquisition_time: u64, shape: FrameShape, data: &[u8]) -> Result<Status> {
        let max = self.segment.max_entry_size();
        let entry_size = shape.byte_len().ok_or(ChannelError::FrameTooLarge {
            max,
            got: usize::MAX,
        })?;
        if entry_size > max {
            return Err(ChannelError::FrameTooLarge {
                max,
                got: entry_size,
            });
        }
        if data.len() < entry_size {
            return Err(ChannelError::ShortFrameData {
                expected: entry_size,
                got: data.len(),
            });
        }

        let header = self.segment.header();
        if header.is_deleted() {
            return Ok(Status::Deleted);
        }

        let index = SlotIndex::for_sequence(header.published_count() + 1);
        // SAFETY: slot_data points at max_entry_size bytes inside the mapping
        // and entry_size <= max; readers never see this slot as newest yet
        unsafe {
            self.segment.slot(index).write(
                acquisition_time,
                shape,
                &data[..entry_size],
                self.segment.slot_data(index),
            );
        }

        // Readers may now pick the slot
        header.advance_published();
        self.wake_waiters();

        Ok(Status::Success)
    }

    /// Broadcast under the wait mutex so a consumer between its recheck and
    /// its sleep cannot miss the wakeup
    fn wake_waiters(&self) {
        let signal = self.segment.header().signal();
        match signal.lock() {
            Ok(guard) => {
                if guard.recovered() {
                    warn!(channel = %self.name, "recovered wait mutex abandoned by a dead process");
                }
                signal.notify_all();
            }
            Err(e) => {
                warn!(channel = %self.name, error = %e, "waking consumers without the wait mutex");
                signal.notify_all();
            }
        }
    }

    /// Read the newest frame into `frame`.
    ///
    /// Returns [`Status::NoNewFrame`] if nothing newer than `frame.uid()` has
    /// been published. With `block` set, first sleeps up to the configured
    /// wait timeout for a publish. A consumer that falls more than
    /// `BUFFER_CNT - 1` publishes behind skips the frames in between.
    pub fn consume(&self, frame: &mut Frame, block: bool) -> Result<Status> {
        let header = self.segment.header();
        if header.is_deleted() {
            return Ok(Status::Deleted);
        }

        if block && frame.uid() >= header.published_count() {
            self.wait_for_publish(frame.uid())?;
            if header.is_deleted() {
                return Ok(Status::Deleted);
            }
        }

        if frame.uid() >= header.published_count() {
            return Ok(Status::NoNewFrame);
        }

        let max = self.segment.max_entry_size();
        frame.reserve_entry(max);

        let mut retries = 0u32;
        loop {
            let uid = header.published_count();
            let index = SlotIndex::for_sequence(uid);
            // SAFETY: the frame buffer holds at least max bytes after
            // reserve_entry, and try_read copies no more than that
            let read = unsafe {
                self.segment
                    .slot(index)
                    .try_read(self.segment.slot_data(index), max, frame.buffer_mut())
            };

            // Once the count moves BUFFER_CNT - 1 past uid, the publisher may
            // have reused the slot for a later frame
            let recycled = header.published_count() - uid >= BUFFER_CNT as u64 - 1;

            if let (Some(read), false) = (read, recycled) {
                frame.set_header(uid, read.acquisition_time, read.shape);
                if retries > 0 {
                    trace!(channel = %self.name, retries, "slot read raced a publish");
                }
                return Ok(Status::Success);
            }

            retries = retries.wrapping_add(1);
            std::hint::spin_loop();
        }
    }

    fn wait_for_publish(&self, last_seen: u64) -> Result<()> {
        let header = self.segment.header();
        let signal = header.signal();

        let mut guard = match signal.lock() {
            Ok(guard) => guard,
            Err(e) => return Err(self.coordination_failure(e)),
        };
        if guard.recovered() {
            warn!(channel = %self.name, "recovered wait mutex abandoned by a dead process");
        }

        // A publish may have landed between the caller's check and the lock
        if last_seen < header.published_count() || header.is_deleted() {
            return Ok(());
        }

        debug!(channel = %self.name, timeout = ?self.wait_timeout, "waiting for publish");
        match guard.wait_timeout(self.wait_timeout) {
            Ok(outcome) => {
                trace!(channel = %self.name, ?outcome, "wait finished");
                Ok(())
            }
            Err(e) => {
                drop(guard);
                Err(self.coordination_failure(e))
            }
        }
    }

    /// A broken wait mutex poisons the whole channel
    fn coordination_failure(&self, e: io::Error) -> ChannelError {
        let header = self.segment.header();
        if header.signal().state() == LockState::Poisoned {
            header.mark_deleted();
            error!(channel = %self.name, error = %e, "wait mutex poisoned, channel marked deleted");
        }
        ChannelError::Coordination(e)
    }

    /// Detach now instead of at end of scope
    pub fn close(self) {
        drop(self);
    }

    /// Channel name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file path
    #[inline]
    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    /// True if this handle created the backing file
    #[inline]
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Largest frame in bytes the channel accepts
    #[inline]
    pub fn max_entry_size(&self) -> usize {
        self.segment.max_entry_size()
    }

    /// Total bytes of the shared segment
    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment.size()
    }

    /// Number of frames published so far
    #[inline]
    pub fn published_count(&self) -> u64 {
        self.segment.header().published_count()
    }

    /// Handles attached across all processes
    #[inline]
    pub fn reference_count(&self) -> u64 {
        self.segment.header().reference_count()
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.segment.header().is_deleted()
    }

    fn detach(&mut self) {
        let header = self.segment.header();

        if self.is_creator {
            header.mark_deleted();
            // Sleeping consumers should see the deletion now, not at their timeout
            self.wake_waiters();
        }

        // Serialize the final unlink with concurrent creates of the same name
        let lock = FileLock::acquire(&self.lock_path);
        if let Err(e) = &lock {
            warn!(channel = %self.name, error = %e, "detaching without the global lock");
        }

        if header.detach_ref() == 0 {
            match remove_backing_file(self.segment.path()) {
                Ok(()) => info!(
                    path = %self.segment.path().display(),
                    freed = self.segment.size(),
                    "Destroyed channel"
                ),
                Err(e) => warn!(
                    path = %self.segment.path().display(),
                    error = %e,
                    "failed to remove backing file"
                ),
            }
        }
        // The mapping itself goes away when `segment` drops
    }
}

/// Left behind by a creator that died before stamping the header
fn is_unfinished(err: &ChannelError) -> bool {
    match err {
        ChannelError::InvalidMagic { .. } => true,
        ChannelError::Corrupt { len, .. } => *len < header_size(),
        _ => false,
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("path", &self.segment.path())
            .field("is_creator", &self.is_creator)
            .field("max_entry_size", &self.max_entry_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn test_config(wait_timeout: Duration) -> ChannelConfig {
        let dir = std::env::temp_dir();
        ChannelConfig {
            block_stub: format!(
                "{}/frame_channel_test_{}_",
                dir.display(),
                std::process::id()
            ),
            lock_path: dir.join(format!("frame_channel_test_{}.lock", std::process::id())),
            wait_timeout,
        }
    }

    fn config() -> ChannelConfig {
        test_config(Duration::from_millis(300))
    }

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_publish_then_consume() {
        let config = config();
        let producer = Channel::create_or_open_with("roundtrip", 1024, &config).unwrap();
        assert!(producer.is_creator());
        assert_eq!(producer.reference_count(), 1);
        assert_eq!(producer.segment_size(), header_size() + 3 * 1024);

        let consumer = Channel::open_existing_with("roundtrip", &config).unwrap();
        assert!(!consumer.is_creator());
        assert_eq!(consumer.reference_count(), 2);

        let shape = FrameShape::new(8, 4, 3, 2);
        let data = pattern(9, 192);
        assert_eq!(producer.publish(777, shape, &data).unwrap(), Status::Success);

        let mut frame = Frame::new();
        assert_eq!(consumer.consume(&mut frame, false).unwrap(), Status::Success);
        assert_eq!(frame.uid(), 1);
        assert_eq!(frame.acquisition_time(), 777);
        assert_eq!(frame.shape(), shape);
        assert_eq!(frame.data(), data.as_slice());
        assert_eq!(frame.capacity(), 1024);

        // Same frame again is not new
        assert_eq!(consumer.consume(&mut frame, false).unwrap(), Status::NoNewFrame);
    }

    #[test]
    fn test_newest_frame_wins() {
        let config = config();
        let channel = Channel::create_or_open_with("newest", 64, &config).unwrap();

        for i in 1..=5u8 {
            let data = vec![i; 16];
            channel
                .publish(i as u64 * 10, FrameShape::new(4, 4, 1, 1), &data)
                .unwrap();
        }
        assert_eq!(channel.published_count(), 5);

        let mut frame = Frame::new();
        assert_eq!(channel.consume(&mut frame, false).unwrap(), Status::Success);
        assert_eq!(frame.uid(), 5);
        assert_eq!(frame.acquisition_time(), 50);
        assert_eq!(frame.data(), &[5u8; 16]);
    }

    #[test]
    fn test_non_blocking_returns_immediately() {
        let config = test_config(Duration::from_secs(5));
        let channel = Channel::create_or_open_with("nonblocking", 64, &config).unwrap();
        let mut frame = Frame::new();

        let start = Instant::now();
        assert_eq!(channel.consume(&mut frame, false).unwrap(), Status::NoNewFrame);
        assert!(start.elapsed() < Duration::from_millis(100));
        // Nothing was read, so the buffer was never grown
        assert_eq!(frame.capacity(), 0);
    }

    #[test]
    fn test_blocking_times_out() {
        let config = config();
        let channel = Channel::create_or_open_with("timeout", 64, &config).unwrap();
        let mut frame = Frame::new();

        let start = Instant::now();
        assert_eq!(channel.consume(&mut frame, true).unwrap(), Status::NoNewFrame);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "returned after {:?}", elapsed);
    }

    #[test]
    fn test_blocking_wakes_on_publish() {
        let config = test_config(Duration::from_secs(3));
        let producer = Channel::create_or_open_with("wake", 64, &config).unwrap();
        let consumer = Channel::open_existing_with("wake", &config).unwrap();

        let waiter = thread::spawn(move || {
            let mut frame = Frame::new();
            let start = Instant::now();
            let status = consumer.consume(&mut frame, true).unwrap();
            (status, start.elapsed(), frame.uid())
        });

        thread::sleep(Duration::from_millis(100));
        producer.publish(1, FrameShape::new(1, 1, 1, 1), &[1]).unwrap();

        let (status, elapsed, uid) = waiter.join().unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(uid, 1);
        assert!(elapsed < Duration::from_secs(2), "woke after {:?}", elapsed);
    }

    #[test]
    fn test_creator_drop_wakes_waiter() {
        let config = test_config(Duration::from_secs(3));
        let producer = Channel::create_or_open_with("wake_deleted", 64, &config).unwrap();
        let consumer = Channel::open_existing_with("wake_deleted", &config).unwrap();

        let waiter = thread::spawn(move || {
            let mut frame = Frame::new();
            let start = Instant::now();
            let status = consumer.consume(&mut frame, true).unwrap();
            (status, start.elapsed())
        });

        thread::sleep(Duration::from_millis(100));
        drop(producer);

        let (status, elapsed) = waiter.join().unwrap();
        assert_eq!(status, Status::Deleted);
        assert!(elapsed < Duration::from_secs(2), "woke after {:?}", elapsed);
    }

    #[test]
    fn test_size_mismatch_keeps_attached_channel() {
        let config = config();
        let first = Channel::create_or_open_with("mismatch", 128, &config).unwrap();

        match Channel::create_or_open_with("mismatch", 256, &config) {
            Err(ChannelError::SizeMismatch {
                requested,
                existing,
                ..
            }) => {
                assert_eq!(requested, 256);
                assert_eq!(existing, 128);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Still present, still counted once, still usable
        assert!(first.path().exists());
        assert_eq!(first.reference_count(), 1);
        assert!(!first.is_deleted());
        assert_eq!(
            first.publish(1, FrameShape::new(2, 2, 2, 2), &[3u8; 16]).unwrap(),
            Status::Success
        );

        // Matching size attaches fine, but not as creator
        let second = Channel::create_or_open_with("mismatch", 128, &config).unwrap();
        assert!(!second.is_creator());
        assert_eq!(second.reference_count(), 2);
    }

    #[test]
    fn test_size_mismatch_removes_orphan() {
        let config = config();
        let path = config.segment_path("orphan").unwrap();
        let _ = remove_backing_file(&path);

        // A segment nobody is attached to
        let region = MappedFile::create_exclusive(&path, segment_size(128).unwrap())
            .unwrap()
            .unwrap();
        drop(Segment::initialize(region, 128).unwrap());
        assert!(path.exists());

        assert!(matches!(
            Channel::create_or_open_with("orphan", 256, &config),
            Err(ChannelError::SizeMismatch { .. })
        ));
        assert!(!path.exists());

        // The name is free for the new size now
        let channel = Channel::create_or_open_with("orphan", 256, &config).unwrap();
        assert!(channel.is_creator());
        assert_eq!(channel.max_entry_size(), 256);
    }

    #[test]
    fn test_unfinished_segment_is_reclaimed() {
        let config = config();

        // Died after sizing the file but before stamping the header
        let zeroed = config.segment_path("unfinished_zeroed").unwrap();
        std::fs::write(&zeroed, vec![0u8; segment_size(64).unwrap()]).unwrap();
        // Died between the exclusive open and sizing
        let empty = config.segment_path("unfinished_empty").unwrap();
        std::fs::write(&empty, []).unwrap();

        // Opening never deletes anything
        assert!(matches!(
            Channel::open_existing_with("unfinished_zeroed", &config),
            Err(ChannelError::InvalidMagic { got: 0, .. })
        ));
        assert!(matches!(
            Channel::open_existing_with("unfinished_empty", &config),
            Err(ChannelError::Corrupt { len: 0, .. })
        ));
        assert!(zeroed.exists());
        assert!(empty.exists());

        for name in ["unfinished_zeroed", "unfinished_empty"] {
            let channel = Channel::create_or_open_with(name, 64, &config).unwrap();
            assert!(channel.is_creator());
            assert_eq!(channel.reference_count(), 1);
            assert_eq!(channel.segment_size(), segment_size(64).unwrap());
            assert_eq!(
                channel.publish(3, FrameShape::new(4, 1, 1, 1), &[7u8; 4]).unwrap(),
                Status::Success
            );
            let mut frame = Frame::new();
            assert_eq!(channel.consume(&mut frame, false).unwrap(), Status::Success);
            assert_eq!(frame.data(), &[7u8; 4]);
        }
        assert!(!zeroed.exists());
        assert!(!empty.exists());
    }

    #[test]
    fn test_wrong_version_is_not_reclaimed() {
        let config = config();
        let path = config.segment_path("wrong_version").unwrap();
        let _ = remove_backing_file(&path);

        let region = MappedFile::create_exclusive(&path, segment_size(64).unwrap())
            .unwrap()
            .unwrap();
        drop(Segment::initialize(region, 64).unwrap());

        // Overwrite the version word that follows the magic
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(4)).unwrap();
            file.write_all(&u32::MAX.to_ne_bytes()).unwrap();
        }

        assert!(matches!(
            Channel::create_or_open_with("wrong_version", 64, &config),
            Err(ChannelError::Corrupt { .. })
        ));
        assert!(path.exists());
        remove_backing_file(&path).unwrap();
    }

    #[test]
    fn test_last_handle_removes_file() {
        let config = config();
        let channel = Channel::create_or_open_with("lifetime", 64, &config).unwrap();
        let path = channel.path().to_path_buf();
        assert!(path.exists());
        channel.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_file_survives_while_attached() {
        let config = config();
        let creator = Channel::create_or_open_with("survive", 64, &config).unwrap();
        let opener = Channel::open_existing_with("survive", &config).unwrap();
        let path = creator.path().to_path_buf();

        drop(creator);
        assert!(path.exists());
        assert_eq!(opener.reference_count(), 1);

        // The creator's exit retires the channel for everyone still attached
        assert!(opener.is_deleted());
        let mut frame = Frame::new();
        assert_eq!(opener.consume(&mut frame, false).unwrap(), Status::Deleted);
        assert_eq!(
            opener.publish(1, FrameShape::new(1, 1, 1, 1), &[1]).unwrap(),
            Status::Deleted
        );

        drop(opener);
        assert!(!path.exists());
    }

    #[test]
    fn test_non_creator_drop_leaves_channel_operable() {
        let config = config();
        let creator = Channel::create_or_open_with("operable", 64, &config).unwrap();
        let second = Channel::create_or_open_with("operable", 64, &config).unwrap();
        let path = creator.path().to_path_buf();

        drop(second);
        assert!(path.exists());
        assert_eq!(creator.reference_count(), 1);

        creator.publish(5, FrameShape::new(1, 1, 1, 4), &[1, 2, 3, 4]).unwrap();
        let mut frame = Frame::new();
        assert_eq!(creator.consume(&mut frame, false).unwrap(), Status::Success);
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_open_missing_channel() {
        let config = config();
        match Channel::open_existing_with("never_created", &config) {
            Err(ChannelError::NotFound { name, .. }) => assert_eq!(name, "never_created"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_name_touches_nothing() {
        let config = config();
        assert!(matches!(
            Channel::create_or_open_with("a/b", 64, &config),
            Err(ChannelError::InvalidName { .. })
        ));
        assert!(!Path::new(&format!("{}a", config.block_stub)).exists());
    }

    #[test]
    fn test_oversized_publish_leaves_ring_untouched() {
        let config = config();
        let channel = Channel::create_or_open_with("oversized", 16, &config).unwrap();
        let data = vec![0xEEu8; 32];

        assert!(matches!(
            channel.publish(1, FrameShape::new(32, 1, 1, 1), &data),
            Err(ChannelError::FrameTooLarge { max: 16, got: 32 })
        ));
        assert!(matches!(
            channel.publish(1, FrameShape::new(usize::MAX, 2, 1, 1), &data),
            Err(ChannelError::FrameTooLarge { .. })
        ));
        assert!(matches!(
            channel.publish(1, FrameShape::new(16, 1, 1, 1), &data[..8]),
            Err(ChannelError::ShortFrameData { expected: 16, got: 8 })
        ));

        assert_eq!(channel.published_count(), 0);
        for seq in 0..BUFFER_CNT as u64 {
            let index = SlotIndex::for_sequence(seq);
            assert_eq!(channel.segment.slot(index).version(), 0);
            let bytes = unsafe { std::slice::from_raw_parts(channel.segment.slot_data(index), 16) };
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_poisoned_mutex_deletes_channel() {
        let config = config();
        let channel = Channel::create_or_open_with("poisoned", 16, &config).unwrap();
        channel
            .segment
            .header()
            .signal()
            .set_state(LockState::Poisoned);

        let mut frame = Frame::new();
        assert!(matches!(
            channel.consume(&mut frame, true),
            Err(ChannelError::Coordination(_))
        ));
        assert!(channel.is_deleted());
        assert_eq!(channel.consume(&mut frame, true).unwrap(), Status::Deleted);
    }

    #[test]
    fn test_blocking_never_misses_a_publish() {
        let config = test_config(Duration::from_secs(5));
        let producer = Channel::create_or_open_with("no_lost_wakeup", 64, &config).unwrap();
        let consumer = Channel::open_existing_with("no_lost_wakeup", &config).unwrap();
        let consumer = &consumer;
        let mut frame = Frame::new();

        thread::scope(|s| {
            for round in 1..=50u64 {
                let waiter = s.spawn(move || {
                    let mut frame = frame;
                    let start = Instant::now();
                    let status = consumer.consume(&mut frame, true).unwrap();
                    (status, start.elapsed(), frame)
                });
                // Race the publish against the waiter going to sleep
                producer.publish(round, FrameShape::new(1, 1, 1, 1), &[round as u8]).unwrap();

                let (status, elapsed, returned) = waiter.join().unwrap();
                frame = returned;
                assert_eq!(status, Status::Success);
                assert!(elapsed < Duration::from_secs(2), "round {} woke after {:?}", round, elapsed);
                assert_eq!(frame.uid(), round);
            }
        });
    }

    #[test]
    fn test_consume_recovers_abandoned_mutex() {
        let config = config();
        let producer = Channel::create_or_open_with("abandoned", 16, &config).unwrap();
        let consumer = Channel::open_existing_with("abandoned", &config).unwrap();
        let signal = consumer.segment.header().signal();

        // Holder exits without unlocking
        thread::scope(|s| {
            s.spawn(|| std::mem::forget(signal.lock().unwrap()));
        });
        assert_eq!(signal.state(), LockState::Held);

        let mut frame = Frame::new();
        assert_eq!(consumer.consume(&mut frame, true).unwrap(), Status::NoNewFrame);
        assert_eq!(signal.state(), LockState::Uncontended);
        assert!(!consumer.is_deleted());

        // Abandon it again, this time in the publisher's way
        thread::scope(|s| {
            s.spawn(|| std::mem::forget(signal.lock().unwrap()));
        });
        assert_eq!(
            producer.publish(9, FrameShape::new(2, 1, 1, 1), &[4, 2]).unwrap(),
            Status::Success
        );
        assert_eq!(consumer.consume(&mut frame, true).unwrap(), Status::Success);
        assert_eq!(frame.data(), &[4, 2]);
        assert_eq!(signal.state(), LockState::Uncontended);
    }

    #[test]
    fn test_concurrent_consumer_sees_whole_frames() {
        let config = test_config(Duration::from_millis(50));
        let producer = Channel::create_or_open_with("concurrent", 4096, &config).unwrap();
        let consumer = Channel::open_existing_with("concurrent", &config).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let done = done.clone();
            thread::spawn(move || {
                let mut frame = Frame::new();
                let mut seen = 0u64;
                let mut last_uid = 0u64;
                while !done.load(Ordering::Acquire) {
                    if consumer.consume(&mut frame, false).unwrap() != Status::Success {
                        continue;
                    }
                    assert!(frame.uid() > last_uid);
                    last_uid = frame.uid();
                    // Timestamps equal publish numbers, so a recycled slot shows up here
                    assert_eq!(frame.acquisition_time(), frame.uid());

                    // Each publish fills its frame with a byte derived from its timestamp
                    let fill = (frame.acquisition_time() % 251) as u8;
                    let expected_len = 64 + (frame.acquisition_time() as usize * 7) % 4000;
                    assert_eq!(frame.size(), expected_len);
                    assert!(frame.data().iter().all(|&b| b == fill), "torn frame {}", frame.uid());
                    seen += 1;
                }
                seen
            })
        };

        let mut buf = vec![0u8; 4096];
        for t in 1..=5_000u64 {
            let len = 64 + (t as usize * 7) % 4000;
            buf[..len].fill((t % 251) as u8);
            producer.publish(t, FrameShape::new(len, 1, 1, 1), &buf[..len]).unwrap();
        }
        thread::sleep(Duration::from_millis(20));
        done.store(true, Ordering::Release);

        let seen = reader.join().unwrap();
        assert!(seen > 0);
        assert_eq!(producer.published_count(), 5_000);
    }
}
