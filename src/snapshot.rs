//! Debug snapshots of confirmed scans.
//!
//! The decode loop hands a frame over and moves on; annotation and JPEG
//! encoding happen on a writer task. When the writer falls behind, new
//! snapshots are dropped rather than queued.

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use chrono::Local;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_line_segment_mut, draw_text_mut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SnapshotSettings;
use crate::frame::Frame;
use crate::geometry::Point;

const QUEUE_DEPTH: usize = 8;
const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_ORIGIN: (i32, i32) = (20, 50);
const LABEL_SCALE: f32 = 32.0;

pub struct Snapshot {
    pub station_name: String,
    pub payload: String,
    pub corners: Vec<Point>,
    pub frame: Frame,
}

/// Handle used by decode loops to submit snapshots.
#[derive(Clone)]
pub struct SnapshotSink {
    tx: mpsc::Sender<Snapshot>,
}

impl SnapshotSink {
    /// Start the writer task. It stops once every sink clone is dropped.
    pub fn spawn(settings: &SnapshotSettings) -> (Self, JoinHandle<()>) {
        let font = settings.font_path.as_deref().and_then(load_font);
        let writer = SnapshotWriter {
            dir: settings.dir.clone(),
            font: font.map(Arc::new),
        };
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = tokio::spawn(writer.run(rx));
        (Self { tx }, handle)
    }

    /// Queue a snapshot without waiting. Returns false if it was dropped.
    pub fn submit(&self, snapshot: Snapshot) -> bool {
        match self.tx.try_send(snapshot) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(s)) => {
                log::debug!("[{}] snapshot queue full; dropping", s.station_name);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct SnapshotWriter {
    dir: PathBuf,
    font: Option<Arc<FontVec>>,
}

impl SnapshotWriter {
    async fn run(self, mut rx: mpsc::Receiver<Snapshot>) {
        while let Some(snapshot) = rx.recv().await {
            let dir = self.dir.clone();
            let font = self.font.clone();
            let station = snapshot.station_name.clone();
            let written = tokio::task::spawn_blocking(move || {
                write_snapshot(&dir, font.as_deref(), snapshot)
            })
            .await;
            match written {
                Ok(Ok(path)) => log::debug!("[{}] snapshot saved to {}", station, path.display()),
                Ok(Err(e)) => log::warn!("[{}] snapshot failed: {:#}", station, e),
                Err(e) => log::warn!("[{}] snapshot task failed: {}", station, e),
            }
        }
    }
}

fn load_font(path: &Path) -> Option<FontVec> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("snapshot font {} unreadable: {}", path.display(), e);
            return None;
        }
    };
    match FontVec::try_from_vec(bytes) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("snapshot font {} invalid: {}", path.display(), e);
            None
        }
    }
}

/// Keep letters and digits only, so station names are safe directory names.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| c.is_alphanumeric()).collect();
    if cleaned.is_empty() {
        "station".to_string()
    } else {
        cleaned
    }
}

/// Annotate and save one snapshot; returns the written path.
pub fn write_snapshot(dir: &Path, font: Option<&FontVec>, snapshot: Snapshot) -> Result<PathBuf> {
    let mut image = snapshot
        .frame
        .into_rgb_image()
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
    annotate(&mut image, &snapshot.corners, &snapshot.payload, font);

    let station_dir = dir.join(sanitize_name(&snapshot.station_name));
    std::fs::create_dir_all(&station_dir)
        .with_context(|| format!("failed to create {}", station_dir.display()))?;
    let path = station_dir.join(format!(
        "{}_scan_success.jpg",
        Local::now().format("%H%M%S")
    ));
    image
        .save(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Outline the symbol when all four corners are known; label it when a font
/// is available.
pub fn annotate(image: &mut RgbImage, corners: &[Point], payload: &str, font: Option<&FontVec>) {
    if corners.len() == 4 {
        for i in 0..4 {
            let (a, b) = (corners[i], corners[(i + 1) % 4]);
            // Two px wide: the segment plus a copy shifted by one pixel.
            for shift in [0.0, 1.0] {
                draw_line_segment_mut(image, (a.x + shift, a.y), (b.x + shift, b.y), OUTLINE);
            }
        }
    }
    if let Some(font) = font {
        draw_text_mut(
            image,
            LABEL,
            LABEL_ORIGIN.0,
            LABEL_ORIGIN.1,
            PxScale::from(LABEL_SCALE),
            font,
            payload,
        );
    }
}
