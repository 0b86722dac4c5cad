//! Frame sources.
//!
//! - RTSP streams from IP cameras (feature: rtsp-gstreamer)
//! - Synthetic `stub://` streams (demos, tests)
//!
//! Sources are blocking; the capture loop drives them from
//! `tokio::task::spawn_blocking` and owns exactly one at a time.

pub mod rtsp;

pub use rtsp::{RtspConfig, RtspOpener, RtspSource, RtspStats};

use anyhow::{Context, Result};

use crate::frame::Frame;
use crate::registry::CameraSource;

/// One open connection to a camera.
pub trait FrameSource: Send {
    /// Read the next frame. `Ok(None)` means the transport handed back an
    /// empty frame, which callers treat as signal loss.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Pull and discard one frame (used to flush stale transport buffers).
    /// An empty frame is an error: a stream that cannot deliver during
    /// warm-up is not connected.
    fn grab(&mut self) -> Result<()> {
        self.next_frame()?
            .map(drop)
            .context("stream handed back an empty frame")
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens connections for the capture loop.
///
/// `open` returns a connected source; discarding warm-up frames is the
/// capture loop's job.
pub trait SourceOpener: Send + Sync {
    fn open(&self, camera: &CameraSource) -> Result<Box<dyn FrameSource>>;
}
