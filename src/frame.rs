//! Frame container and pre-context buffering.
//!
//! - `Frame`: Immutable captured raster. Cloning shares the pixels, never copies them.
//! - `SlidingWindow`: Bounded FIFO of the most recent frames. Seeds the lead-up
//!   context of a newly opened incident.
//!
//! Pixels are never mutated after capture. Anything that wants to draw on a frame
//! (preview overlays) works on its own copy via `Frame::to_rgb_image()`.

use image::RgbImage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Default sliding window capacity: one second of capture at 30 fps.
pub const DEFAULT_WINDOW_FRAMES: usize = 30;

// ----------------------------------------------------------------------------
// Frame: shared, immutable raster
// ----------------------------------------------------------------------------

/// A captured RGB frame.
///
/// `seq` is the arrival order assigned by the frame source. `captured_at` is the
/// monotonic capture instant. The image is behind an `Arc`: the sliding window and
/// an open incident may both hold the same frame and neither owns it exclusively.
#[derive(Clone, Debug)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: Instant,
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(seq: u64, captured_at: Instant, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at,
            image: Arc::new(image),
        }
    }

    /// Build a frame from packed RGB24 bytes.
    ///
    /// Returns `None` when the buffer length does not match `width * height * 3`.
    pub fn from_rgb(seq: u64, width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let image = RgbImage::from_raw(width, height, pixels)?;
        Some(Self::new(seq, Instant::now(), image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Read-only access to the pixels.
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Owned copy of the pixels, for callers that need to draw.
    pub fn to_rgb_image(&self) -> RgbImage {
        self.image.as_ref().clone()
    }

    /// True when both frames share the same pixel allocation.
    pub fn shares_pixels_with(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

// ----------------------------------------------------------------------------
// SlidingWindow: bounded pre-context history
// ----------------------------------------------------------------------------

/// Fixed-capacity rolling history of recent frames.
///
/// Invariant: `len() <= capacity()` after every operation. Once full, each push
/// evicts exactly the oldest entry (strict FIFO, no reordering).
#[derive(Debug)]
pub struct SlidingWindow {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame, evicting the oldest entry when at capacity.
    pub fn push(&mut self, frame: Frame) {
        if self.capacity == 0 {
            return;
        }
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Copy of the current contents in arrival order.
    ///
    /// The returned vector is independent of the window: later pushes do not
    /// change it.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent frame, if any.
    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_FRAMES)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
