//! Per-station pipeline: a capture task and a decode task sharing one
//! `FrameBuffer`.
//!
//! ```text
//! camera -> run_capture -> FrameBuffer (3) -> run_scan -> Debouncer -> EventDispatcher
//!                                                             \-> SnapshotSink
//! ```

pub mod capture;
pub mod scan;

pub use capture::run_capture;
pub use scan::{run_scan, ScanContext};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{CaptureSettings, DebounceSettings};
use crate::decode::DecodeChain;
use crate::dispatch::EventDispatcher;
use crate::frame::FrameBuffer;
use crate::ingest::SourceOpener;
use crate::registry::CameraSource;
use crate::snapshot::SnapshotSink;
use crate::supervisor::PipelineRunner;

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Builds and runs the real capture + decode pipeline for a station.
///
/// The decode chain, dispatcher and snapshot sink are shared by all
/// stations; buffers and debouncers are per station.
pub struct ScanPipelineRunner {
    opener: Arc<dyn SourceOpener>,
    chain: Arc<DecodeChain>,
    dispatcher: Arc<EventDispatcher>,
    snapshots: Option<SnapshotSink>,
    capture: CaptureSettings,
    debounce: DebounceSettings,
}

impl ScanPipelineRunner {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        chain: Arc<DecodeChain>,
        dispatcher: Arc<EventDispatcher>,
        capture: CaptureSettings,
        debounce: DebounceSettings,
    ) -> Self {
        Self {
            opener,
            chain,
            dispatcher,
            snapshots: None,
            capture,
            debounce,
        }
    }

    pub fn with_snapshots(mut self, sink: SnapshotSink) -> Self {
        self.snapshots = Some(sink);
        self
    }
}

#[async_trait]
impl PipelineRunner for ScanPipelineRunner {
    async fn run(&self, station: CameraSource, cancel: CancellationToken) -> Result<()> {
        let buffer = Arc::new(FrameBuffer::new());
        let pipeline = cancel.child_token();

        let ctx = ScanContext {
            station: station.clone(),
            chain: self.chain.clone(),
            dispatcher: self.dispatcher.clone(),
            snapshots: self.snapshots.clone(),
            debounce: self.debounce.clone(),
            idle: self.capture.decode_idle,
        };
        let mut scan = tokio::spawn(run_scan(ctx, buffer.clone(), pipeline.clone()));

        let capture = run_capture(
            &station,
            self.opener.clone(),
            buffer,
            &self.capture,
            &pipeline,
        );
        // Capture only returns on cancellation; the decode task ending first
        // means it died, and the whole pipeline goes with it.
        let outcome = tokio::select! {
            () = capture => None,
            joined = &mut scan => Some(joined),
        };
        pipeline.cancel();

        let joined = match outcome {
            Some(joined) => joined,
            None => scan.await,
        };
        joined.map_err(|e| anyhow!("decode loop for {} failed: {}", station.station_name, e))
    }
}
