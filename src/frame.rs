//! Frames and the per-camera freshness buffer.
//!
//! - `Frame`: one decoded RGB8 image. Not `Clone`; it moves from the capture
//!   loop into the buffer, then into the decode loop.
//! - `FrameBuffer`: bounded FIFO shared by the two loops of one camera. When
//!   full, a push evicts the oldest frame first (freshness over completeness).

use anyhow::{anyhow, Result};
use image::{GrayImage, ImageBuffer, Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Frames held per camera before the oldest is evicted.
pub const FRAME_BUFFER_CAPACITY: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image, packed RGB8, row-major without padding.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

// No Clone: exactly one stage owns a frame at a time.

impl Frame {
    /// Wrap packed RGB8 pixels. Fails when the length does not match.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Expand a greyscale image into an RGB frame.
    pub fn from_luma(image: &GrayImage) -> Self {
        let data = image.as_raw().iter().flat_map(|&v| [v, v, v]).collect();
        Self {
            data,
            width: image.width(),
            height: image.height(),
        }
    }

    /// True for a zero-sized frame (treated as signal loss by the capture loop).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Borrowing RGB view over the pixel data.
    pub fn rgb_view(&self) -> Option<ImageBuffer<Rgb<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
    }

    /// Greyscale conversion used by the symbol decoders (BT.601 weights).
    pub fn to_luma(&self) -> GrayImage {
        let width = self.width as usize;
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let idx = (y as usize * width + x as usize) * 3;
            let px = &self.data[idx..idx + 3];
            let weighted = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
            image::Luma([((weighted + 500) / 1000) as u8])
        })
    }

    /// Owned RGB image, consuming the frame.
    pub fn into_rgb_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data)
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Bounded freshness window between the capture and decode loops.
///
/// Not a work queue: under overload the oldest frames are dropped so the
/// decoder always sees recent images.
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a frame, evicting from the front while at capacity.
    /// Returns how many frames were evicted.
    pub fn push(&self, frame: Frame) -> usize {
        let mut frames = self.lock();
        let mut evicted = 0;
        while frames.len() >= self.capacity {
            frames.pop_front();
            evicted += 1;
        }
        frames.push_back(frame);
        evicted
    }

    /// Dequeue the oldest frame.
    pub fn pop(&self) -> Option<Frame> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop everything buffered (used when a pipeline stops).
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
