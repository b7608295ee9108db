//! Client-side frames

/// Dimensions of a frame and the width of one element
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    /// Size of each element in bytes
    pub element_size: usize,
}

impl FrameShape {
    pub const fn new(width: usize, height: usize, depth: usize, element_size: usize) -> Self {
        Self {
            width,
            height,
            depth,
            element_size,
        }
    }

    /// Total bytes described by this shape, `None` on overflow
    #[inline]
    pub fn byte_len(&self) -> Option<usize> {
        self.width
            .checked_mul(self.height)?
            .checked_mul(self.depth)?
            .checked_mul(self.element_size)
    }
}

/// A frame read out of a channel
///
/// Owned by the consumer and reused across reads. The buffer grows to the
/// channel's maximum entry size on the first successful read and is never
/// shrunk, so steady-state reads do not allocate.
#[derive(Debug, Default)]
pub struct Frame {
    shape: FrameShape,
    acquisition_time: u64,
    uid: u64,
    data: Vec<u8>,
}

impl Frame {
    /// An empty frame that has seen nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.shape.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.shape.height
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.shape.depth
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.shape.element_size
    }

    /// Acquisition timestamp written by the publisher
    #[inline]
    pub fn acquisition_time(&self) -> u64 {
        self.acquisition_time
    }

    /// Sequence number of the publish this frame came from
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Number of valid bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.byte_len().unwrap_or(0).min(self.data.len())
    }

    /// The valid bytes of the last frame read
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.size()]
    }

    /// Bytes currently allocated for frame data
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Grow the buffer to at least `len` bytes
    pub(crate) fn reserve_entry(&mut self, len: usize) {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn set_header(&mut self, uid: u64, acquisition_time: u64, shape: FrameShape) {
        self.uid = uid;
        self.acquisition_time = acquisition_time;
        self.shape = shape;
    }
}
