//! Capture loop: keeps one camera connection alive and feeds its buffer.

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::pause;
use crate::config::CaptureSettings;
use crate::frame::FrameBuffer;
use crate::ingest::{FrameSource, SourceOpener};
use crate::registry::CameraSource;

/// Run until `cancel` fires. Connection problems never end the loop: a
/// failed open is retried after `open_retry`, an empty frame or read error
/// drops the connection and reopens after `signal_loss_backoff`.
pub async fn run_capture(
    camera: &CameraSource,
    opener: Arc<dyn SourceOpener>,
    buffer: Arc<FrameBuffer>,
    settings: &CaptureSettings,
    cancel: &CancellationToken,
) {
    let name = camera.station_name.as_str();
    let mut slot: Option<Box<dyn FrameSource>> = None;
    log::info!("[{}] capture started", name);

    while !cancel.is_cancelled() {
        let source = match slot.take() {
            Some(source) if source.is_healthy() => source,
            Some(source) => {
                drop(source);
                log::warn!("[{}] stream stalled; reconnecting", name);
                if !pause(cancel, settings.signal_loss_backoff).await {
                    break;
                }
                continue;
            }
            None => {
                let opened = tokio::select! {
                    _ = cancel.cancelled() => break,
                    opened = open_source(camera, opener.clone(), settings.warmup_frames) => opened,
                };
                match opened {
                    Ok(Ok(source)) => {
                        log::info!("[{}] camera connected", name);
                        source
                    }
                    Ok(Err(e)) => {
                        log::warn!(
                            "[{}] connect failed: {:#}; retrying in {:?}",
                            name,
                            e,
                            settings.open_retry
                        );
                        if !pause(cancel, settings.open_retry).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        log::error!("[{}] connect fault: {}", name, e);
                        if !pause(cancel, settings.fault_cooldown).await {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::task::spawn_blocking(move || {
                let mut source = source;
                let frame = source.next_frame();
                (source, frame)
            }) => read,
        };

        let wait = match read {
            Ok((source, Ok(Some(frame)))) if !frame.is_empty() => {
                slot = Some(source);
                let evicted = buffer.push(frame);
                if evicted > 0 {
                    log::trace!("[{}] decoder behind; dropped {} stale frame(s)", name, evicted);
                }
                settings.read_interval
            }
            Ok((source, Ok(_))) => {
                drop(source);
                log::warn!("[{}] signal lost (empty frame); reconnecting", name);
                settings.signal_loss_backoff
            }
            Ok((source, Err(e))) => {
                drop(source);
                log::warn!("[{}] signal lost: {:#}; reconnecting", name, e);
                settings.signal_loss_backoff
            }
            // The source went down with the panicking read.
            Err(e) => {
                log::error!("[{}] capture fault: {}", name, e);
                settings.fault_cooldown
            }
        };
        if !pause(cancel, wait).await {
            break;
        }
    }

    drop(slot);
    buffer.clear();
    log::info!("[{}] capture stopped", name);
}

/// Connect and flush the first `warmup` frames, which RTSP servers tend to
/// hand out from a stale buffer.
async fn open_source(
    camera: &CameraSource,
    opener: Arc<dyn SourceOpener>,
    warmup: u32,
) -> Result<Result<Box<dyn FrameSource>>, JoinError> {
    let camera = camera.clone();
    tokio::task::spawn_blocking(move || {
        let mut source = opener.open(&camera)?;
        for _ in 0..warmup {
            source.grab()?;
        }
        Ok(source)
    })
    .await
}
