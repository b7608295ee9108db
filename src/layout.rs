//! Shared segment layout
//!
//! ```text
//! +------------------------------+  offset 0
//! | SegmentHeader                |
//! |   magic, version             |
//! |   max_entry_size_bytes       |
//! |   reference_count            |
//! |   published_count            |
//! |   deleted                    |
//! |   slots[BUFFER_CNT]          |
//! |   signal (mutex + condvar)   |
//! +------------------------------+  header_size(), cache-line aligned
//! | slot 0 data                  |  max_entry_size_bytes each
//! | slot 1 data                  |
//! | slot 2 data                  |
//! +------------------------------+
//! ```
//!
//! Every participant may map the segment at a different address, so nothing
//! in here stores a pointer.

use crate::error::{ChannelError, Result};
use crate::seqlock::SlotMetadata;
use crate::shm::MappedFile;
use crate::signal::SharedSignal;
use std::path::Path;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Number of frames stored in each channel
pub const BUFFER_CNT: usize = 3;

/// Magic number for segment validation
const SEGMENT_MAGIC: u32 = 0x434D_4642; // "CMFB"
const SEGMENT_VERSION: u32 = 1;

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

const fn align_up(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Header stored at the beginning of every segment
#[repr(C)]
pub struct SegmentHeader {
    magic: u32,
    version: u32,
    max_entry_size_bytes: u64,
    reference_count: AtomicU64,
    published_count: AtomicU64,
    deleted: AtomicBool,
    slots: [SlotMetadata; BUFFER_CNT],
    signal: SharedSignal,
}

impl SegmentHeader {
    /// Handles attached across all processes
    #[inline]
    pub fn reference_count(&self) -> u64 {
        self.reference_count.load(Ordering::Acquire)
    }

    /// Count one more attached handle, returning the new count
    #[inline]
    pub fn attach_ref(&self) -> u64 {
        self.reference_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Count one fewer attached handle, returning the remaining count
    #[inline]
    pub fn detach_ref(&self) -> u64 {
        self.reference_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Sequence number of the newest completed publish
    #[inline]
    pub fn published_count(&self) -> u64 {
        self.published_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn advance_published(&self) -> u64 {
        self.published_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    #[inline]
    pub fn signal(&self) -> &SharedSignal {
        &self.signal
    }
}

/// Ring slot index, always below [`BUFFER_CNT`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotIndex(usize);

impl SlotIndex {
    /// Slot that publish number `sequence` lands in
    #[inline]
    pub fn for_sequence(sequence: u64) -> Self {
        Self((sequence % BUFFER_CNT as u64) as usize)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

/// Bytes reserved for the header, including padding up to the data region
pub const fn header_size() -> usize {
    align_up(std::mem::size_of::<SegmentHeader>())
}

/// Total segment size for a given entry size, `None` on overflow
pub fn segment_size(max_entry_size_bytes: usize) -> Option<usize> {
    max_entry_size_bytes
        .checked_mul(BUFFER_CNT)?
        .checked_add(header_size())
}

/// A mapped segment with typed access to its header and slots
pub struct Segment {
    region: MappedFile,
}

impl Segment {
    /// Lay out a freshly created, zeroed region.
    ///
    /// Initializes every slot and the shared signal, then stamps the magic.
    pub fn initialize(region: MappedFile, max_entry_size_bytes: usize) -> Result<Self> {
        let expected = segment_size(max_entry_size_bytes).unwrap_or(usize::MAX);
        if region.size() != expected {
            return Err(ChannelError::Corrupt {
                path: region.path().to_path_buf(),
                len: region.size(),
                expected,
            });
        }

        let header = region.as_ptr() as *mut SegmentHeader;
        unsafe {
            addr_of_mut!((*header).version).write(SEGMENT_VERSION);
            addr_of_mut!((*header).max_entry_size_bytes).write(max_entry_size_bytes as u64);
            addr_of_mut!((*header).reference_count).write(AtomicU64::new(0));
            addr_of_mut!((*header).published_count).write(AtomicU64::new(0));
            addr_of_mut!((*header).deleted).write(AtomicBool::new(false));

            for i in 0..BUFFER_CNT {
                SlotMetadata::init(addr_of_mut!((*header).slots[i]));
            }

            SharedSignal::init(addr_of_mut!((*header).signal)).map_err(ChannelError::Coordination)?;

            std::sync::atomic::fence(Ordering::Release);
            addr_of_mut!((*header).magic).write(SEGMENT_MAGIC);
        }

        Ok(Self { region })
    }

    /// Wrap an existing region after checking its magic and version
    pub fn attach(region: MappedFile) -> Result<Self> {
        let header = region.as_ptr() as *const SegmentHeader;
        let (magic, version) = unsafe { ((*header).magic, (*header).version) };

        if magic != SEGMENT_MAGIC {
            return Err(ChannelError::InvalidMagic {
                expected: SEGMENT_MAGIC,
                got: magic,
            });
        }
        if version != SEGMENT_VERSION {
            return Err(ChannelError::Corrupt {
                path: region.path().to_path_buf(),
                len: region.size(),
                expected: segment_size(unsafe { (*header).max_entry_size_bytes } as usize)
                    .unwrap_or(usize::MAX),
            });
        }

        Ok(Self { region })
    }

    /// Check the mapping length against the recorded entry size
    pub fn check_length(&self) -> Result<()> {
        let expected = segment_size(self.max_entry_size()).unwrap_or(usize::MAX);
        if self.region.size() != expected {
            return Err(ChannelError::Corrupt {
                path: self.region.path().to_path_buf(),
                len: self.region.size(),
                expected,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: the region is at least header_size() bytes and page aligned;
        // every mutable field is atomic or internally synchronized
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }

    /// Fixed at creation, identical for every participant
    #[inline]
    pub fn max_entry_size(&self) -> usize {
        self.header().max_entry_size_bytes as usize
    }

    #[inline]
    pub fn slot(&self, index: SlotIndex) -> &SlotMetadata {
        &self.header().slots[index.get()]
    }

    /// Start of a slot's data region, valid for [`Segment::max_entry_size`] bytes
    #[inline]
    pub fn slot_data(&self, index: SlotIndex) -> *mut u8 {
        let offset = header_size() + index.get() * self.max_entry_size();
        debug_assert!(offset + self.max_entry_size() <= self.region.size());
        unsafe { self.region.as_ptr().add(offset) }
    }

    /// Bytes mapped
    #[inline]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.region.path()
    }
}
