//! Per-slot SeqLock
//!
//! Every ring slot carries two sequence counters. The single writer bumps
//! `seq_before`, writes the slot, then copies the new value into `seq_after`.
//! A reader loads `seq_after`, copies the slot, then loads `seq_before`; the
//! copy is consistent only if both loads agree. Readers never block the
//! writer, they just retry.

use crate::frame::FrameShape;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Metadata record for one ring slot, stored in shared memory
#[repr(C)]
pub struct SlotMetadata {
    seq_before: AtomicU64,
    seq_after: AtomicU64,
    acquisition_time: AtomicU64,
    width: AtomicU64,
    height: AtomicU64,
    depth: AtomicU64,
    element_size: AtomicU64,
}

/// Header fields of a consistent slot read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRead {
    pub acquisition_time: u64,
    pub shape: FrameShape,
    /// Value both sequence counters agreed on
    pub version: u64,
}

impl SlotMetadata {
    /// A slot that has never been written
    pub const fn new() -> Self {
        Self {
            seq_before: AtomicU64::new(0),
            seq_after: AtomicU64::new(0),
            acquisition_time: AtomicU64::new(0),
            width: AtomicU64::new(0),
            height: AtomicU64::new(0),
            depth: AtomicU64::new(0),
            element_size: AtomicU64::new(0),
        }
    }

    /// Initialize a slot in place
    ///
    /// # Safety
    /// The pointer must point to valid, properly aligned memory
    pub unsafe fn init(ptr: *mut Self) {
        ptr.write(Self::new());
    }

    /// Number of completed writes to this slot
    #[inline]
    pub fn version(&self) -> u64 {
        self.seq_after.load(Ordering::Acquire)
    }

    /// True when no write is in progress
    #[inline]
    pub fn is_stable(&self) -> bool {
        self.seq_before.load(Ordering::Acquire) == self.seq_after.load(Ordering::Acquire)
    }

    /// Write a frame into this slot.
    ///
    /// # Safety
    /// - `dst` must point to this slot's data region, valid for `data.len()` bytes
    /// - Only one writer may use a slot at a time
    #[inline]
    pub unsafe fn write(&self, acquisition_time: u64, shape: FrameShape, data: &[u8], dst: *mut u8) {
        let version = self.seq_before.load(Ordering::Relaxed) + 1;

        // Open the write; readers comparing against seq_after now retry
        self.seq_before.store(version, Ordering::Relaxed);
        fence(Ordering::Release);

        self.acquisition_time.store(acquisition_time, Ordering::Relaxed);
        self.width.store(shape.width as u64, Ordering::Relaxed);
        self.height.store(shape.height as u64, Ordering::Relaxed);
        self.depth.store(shape.depth as u64, Ordering::Relaxed);
        self.element_size.store(shape.element_size as u64, Ordering::Relaxed);

        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());

        // Close the write
        self.seq_after.store(version, Ordering::Release);
    }

    /// Make one attempt at copying this slot into `out`.
    ///
    /// At most `capacity` bytes are copied regardless of what the metadata
    /// claims, so a torn header can never push the copy past the slot.
    /// Returns `None` if a write overlapped the copy.
    ///
    /// # Safety
    /// `src` must point to this slot's data region, valid for `capacity` bytes
    #[inline]
    pub unsafe fn try_read(&self, src: *const u8, capacity: usize, out: &mut [u8]) -> Option<SlotRead> {
        let after = self.seq_after.load(Ordering::Acquire);

        let acquisition_time = self.acquisition_time.load(Ordering::Relaxed);
        let shape = FrameShape::new(
            self.width.load(Ordering::Relaxed) as usize,
            self.height.load(Ordering::Relaxed) as usize,
            self.depth.load(Ordering::Relaxed) as usize,
            self.element_size.load(Ordering::Relaxed) as usize,
        );

        let len = shape
            .byte_len()
            .unwrap_or(capacity)
            .min(capacity)
            .min(out.len());
        std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);

        fence(Ordering::Acquire);
        let before = self.seq_before.load(Ordering::Relaxed);

        if before == after {
            Some(SlotRead {
                acquisition_time,
                shape,
                version: after,
            })
        } else {
            None
        }
    }
}

impl Default for SlotMetadata {
    fn default() -> Self {
        Self::new()
    }
}
