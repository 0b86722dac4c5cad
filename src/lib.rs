//! Station Scanner
//!
//! Watches a fleet of fixed cameras, one per packing/dispatch station, and
//! turns QR codes held up in front of them into confirmed scan events.
//!
//! # Architecture
//!
//! Each station runs an independent pipeline:
//!
//! 1. **Capture**: an RTSP connection feeds a 3-frame freshness window,
//!    reconnecting on its own after signal loss.
//! 2. **Decode**: a chain of decoders (quirc, then zxing, then optional
//!    model-proposed crops) turns a frame into at most one payload.
//! 3. **Debounce**: a payload must be seen on consecutive frames before it
//!    is confirmed, and is not confirmed again within the cooldown.
//! 4. **Dispatch**: confirmed scans go out on the push channel as an overlay
//!    message and a business event; a debug snapshot is written alongside.
//!
//! The fleet supervisor polls the station registry and starts, restarts, or
//! stops pipelines as stations come and go.
//!
//! # Module Structure
//!
//! - `frame`: captured frames and the per-station `FrameBuffer`
//! - `ingest`: frame sources (RTSP, synthetic `stub://`)
//! - `decode`: symbol decoders, decode chain, region proposer
//! - `debounce`: vote/cooldown gate
//! - `dispatch`: push transport and event dispatcher
//! - `snapshot`: annotated JPEG snapshots of confirmed scans
//! - `pipeline`: capture and decode loops
//! - `registry`: station/camera registry
//! - `supervisor`: fleet reconciliation
//! - `config`: daemon configuration

pub mod config;
pub mod debounce;
pub mod decode;
pub mod dispatch;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod snapshot;
pub mod supervisor;

pub use config::ScannerConfig;
pub use debounce::Debouncer;
pub use decode::{DecodeChain, DetectionCandidate};
pub use dispatch::{EventDispatcher, MqttTransport, PushTransport, ScanEvent};
pub use frame::{Frame, FrameBuffer, FRAME_BUFFER_CAPACITY};
pub use geometry::{NormalizedBox, Point, Region};
pub use ingest::{FrameSource, SourceOpener};
pub use pipeline::ScanPipelineRunner;
pub use registry::{CameraSource, SqliteRegistry, StaticRegistry, StationId, StationRegistry};
pub use snapshot::SnapshotSink;
pub use supervisor::{FleetSupervisor, PipelineRunner};
