//! Decode loop: frames in, confirmed scan events out.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::pause;
use crate::config::DebounceSettings;
use crate::debounce::Debouncer;
use crate::decode::{DecodeChain, DetectionCandidate};
use crate::dispatch::{EventDispatcher, ScanEvent};
use crate::frame::{Frame, FrameBuffer};
use crate::registry::CameraSource;
use crate::snapshot::{Snapshot, SnapshotSink};

/// Everything one station's decode loop needs besides its buffer.
pub struct ScanContext {
    pub station: CameraSource,
    pub chain: Arc<DecodeChain>,
    pub dispatcher: Arc<EventDispatcher>,
    pub snapshots: Option<SnapshotSink>,
    pub debounce: DebounceSettings,
    /// Sleep when the buffer is empty.
    pub idle: Duration,
}

/// Run until `cancel` fires. Owns the station's debouncer.
pub async fn run_scan(ctx: ScanContext, buffer: Arc<FrameBuffer>, cancel: CancellationToken) {
    let name = ctx.station.station_name.clone();
    let mut debouncer = Debouncer::new(ctx.debounce.vote_threshold, ctx.debounce.cooldown);
    let mut last_prune = Instant::now();
    log::info!("[{}] decode loop started", name);

    while !cancel.is_cancelled() {
        let Some(frame) = buffer.pop() else {
            if !pause(&cancel, ctx.idle).await {
                break;
            }
            continue;
        };

        let chain = ctx.chain.clone();
        let decoded = tokio::select! {
            _ = cancel.cancelled() => break,
            joined = tokio::task::spawn_blocking(move || {
                let candidate = chain.decode(&frame);
                (frame, candidate)
            }) => joined,
        };
        match decoded {
            Ok((frame, Some(candidate))) => {
                ctx.handle_candidate(&mut debouncer, frame, candidate).await;
            }
            Ok((_, None)) => {}
            Err(e) => log::error!("[{}] decode fault: {}", name, e),
        }

        if last_prune.elapsed() >= ctx.debounce.cooldown {
            debouncer.prune(Instant::now());
            last_prune = Instant::now();
        }
    }

    log::info!("[{}] decode loop stopped", name);
}

impl ScanContext {
    async fn handle_candidate(
        &self,
        debouncer: &mut Debouncer,
        frame: Frame,
        candidate: DetectionCandidate,
    ) {
        let name = self.station.station_name.as_str();
        let confirmed = debouncer.vote(&candidate.payload);
        log::info!(
            "[{}] detected {} via {} (vote {}/{})",
            name,
            candidate.payload,
            candidate.strategy,
            if confirmed {
                debouncer.threshold()
            } else {
                debouncer.votes(&candidate.payload)
            },
            debouncer.threshold()
        );
        if !confirmed {
            return;
        }

        let bbox = candidate.bounding_box();
        let event = ScanEvent::new(name, candidate.payload.as_str(), bbox);
        log::info!(
            "[{}] confirmed {} | box {:.1}% {:.1}%",
            name,
            event.code,
            bbox.x,
            bbox.y
        );

        if let Some(sink) = &self.snapshots {
            sink.submit(Snapshot {
                station_name: self.station.station_name.clone(),
                payload: candidate.payload,
                corners: candidate.corners,
                frame,
            });
        }

        self.dispatcher.send_overlay(&event).await;
        if self.dispatcher.send_confirmed(&event).await {
            log::info!("[{}] event {} sent", name, event.code);
        } else {
            log::error!(
                "[{}] event {} NOT sent; check the push channel configuration",
                name,
                event.code
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::test_support::qr_canvas;
    use crate::dispatch::PushTransport;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl RecordingTransport {
        fn on(&self, topic: &str) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, v)| v.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        fn is_connected(&self) -> bool {
            true
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            let value = serde_json::from_slice(&payload)?;
            self.sent.lock().unwrap().push((topic.to_string(), value));
            Ok(())
        }
    }

    fn qr_frame(payload: &str) -> Frame {
        Frame::from_luma(&qr_canvas(payload, 4, (240, 180), 60, 30))
    }

    async fn drain(buffer: &FrameBuffer) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !buffer.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("decode loop drained the buffer");
        // Let the last decode finish and dispatch.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn repeated_code_confirms_once_within_cooldown() {
        let transport = Arc::new(RecordingTransport::default());
        let ctx = ScanContext {
            station: CameraSource {
                station_id: 5,
                station_name: "Packing 5".into(),
                uri: "stub://p5".into(),
                enabled: true,
            },
            chain: Arc::new(DecodeChain::standard()),
            dispatcher: Arc::new(EventDispatcher::new(transport.clone(), "scan")),
            snapshots: None,
            debounce: DebounceSettings::default(),
            idle: Duration::from_millis(1),
        };
        let buffer = Arc::new(FrameBuffer::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_scan(ctx, buffer.clone(), cancel.clone()));

        // One sighting is not enough.
        buffer.push(qr_frame("BOX-1"));
        drain(&buffer).await;
        assert!(transport.on("scan/events").is_empty());

        // Second consecutive sighting confirms; later ones hit the cooldown.
        for _ in 0..3 {
            buffer.push(qr_frame("BOX-1"));
            drain(&buffer).await;
        }

        let events = transport.on("scan/events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["station"], "Packing 5");
        assert_eq!(events[0]["code"], "BOX-1");
        assert!(events[0]["w"].as_f64().unwrap() > 0.0);
        assert_eq!(transport.on("scan/overlay").len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
