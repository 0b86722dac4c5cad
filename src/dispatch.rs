//! Push channel for scan results.
//!
//! Every confirmed scan leaves a station as two messages:
//! - overlay: best effort, drives the live bounding box in the UI
//! - confirmed: the business event, reported as sent or not sent
//!
//! Both are JSON bodies on `{prefix}/overlay` and `{prefix}/events`. The MQTT
//! connection is shared by all stations and driven by one background task that
//! reconnects on its own; senders never block on the network.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PushSettings;
use crate::geometry::NormalizedBox;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// One scan result as sent on the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanEvent {
    pub station: String,
    pub code: String,
    #[serde(flatten)]
    pub bbox: NormalizedBox,
    pub timestamp_ms: i64,
}

impl ScanEvent {
    pub fn new(station: impl Into<String>, code: impl Into<String>, bbox: NormalizedBox) -> Self {
        Self {
            station: station.into(),
            code: code.into(),
            bbox,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Hand one message to the transport. Must not wait on the network.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

pub struct EventDispatcher {
    transport: Arc<dyn PushTransport>,
    overlay_topic: String,
    events_topic: String,
}

impl EventDispatcher {
    pub fn new(transport: Arc<dyn PushTransport>, topic_prefix: &str) -> Self {
        let prefix = topic_prefix.trim_end_matches('/');
        Self {
            transport,
            overlay_topic: format!("{}/overlay", prefix),
            events_topic: format!("{}/events", prefix),
        }
    }

    pub fn overlay_topic(&self) -> &str {
        &self.overlay_topic
    }

    pub fn events_topic(&self) -> &str {
        &self.events_topic
    }

    /// Fire-and-forget overlay update. Dropped silently when offline.
    pub async fn send_overlay(&self, event: &ScanEvent) {
        if !self.transport.is_connected() {
            return;
        }
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("[{}] overlay encode failed: {}", event.station, e);
                return;
            }
        };
        if let Err(e) = self.transport.publish(&self.overlay_topic, payload).await {
            log::debug!("[{}] overlay dropped: {:#}", event.station, e);
        }
    }

    /// Send a confirmed event. Returns whether the transport accepted it;
    /// nothing is queued for later.
    pub async fn send_confirmed(&self, event: &ScanEvent) -> bool {
        if !self.transport.is_connected() {
            log::warn!(
                "[{}] push channel offline; event {} not sent",
                event.station,
                event.code
            );
            return false;
        }
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("[{}] event encode failed: {}", event.station, e);
                return false;
            }
        };
        match self.transport.publish(&self.events_topic, payload).await {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "[{}] event {} not sent: {:#}",
                    event.station,
                    event.code,
                    e
                );
                false
            }
        }
    }
}

/// MQTT v5 transport with a background connection driver.
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Build the client and spawn the task that polls the connection until
    /// `cancel` fires. Connecting happens in the background; until the broker
    /// acknowledges, `is_connected` is false.
    pub fn spawn(
        settings: &PushSettings,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let (host, port) = settings.broker_host_port()?;
        let status_topic = format!("{}/status", settings.topic_prefix);

        let mut options = MqttOptions::new(settings.client_id.as_str(), host.as_str(), port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user.as_str(), settings.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            status_topic.clone(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));

        let (client, eventloop) = AsyncClient::new(options, 64);
        let transport = Arc::new(Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
        });
        log::info!(
            "push channel: broker {}:{} (auth: {})",
            host,
            port,
            settings.username.is_some()
        );

        let driver = ConnectionDriver {
            eventloop,
            client: transport.client.clone(),
            connected: transport.connected.clone(),
            status_topic,
            reconnect_delay: settings.reconnect_delay,
        };
        let handle = tokio::spawn(driver.run(cancel));
        Ok((transport, handle))
    }
}

#[async_trait]
impl PushTransport for MqttTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // try_publish only enqueues, so a slow broker cannot stall a decode loop.
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("publish to {} failed: {}", topic, e))
    }
}

struct ConnectionDriver {
    eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    status_topic: String,
    reconnect_delay: Duration,
}

impl ConnectionDriver {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    self.close().await;
                    break;
                }
                event = self.eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("push channel connected");
                    if let Err(e) = self.client.try_publish(
                        self.status_topic.as_str(),
                        QoS::AtLeastOnce,
                        true,
                        PAYLOAD_ONLINE.as_bytes().to_vec(),
                    ) {
                        log::debug!("status publish failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        log::warn!("push channel lost: {}", e);
                    } else {
                        log::debug!("push channel connect failed: {}", e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        log::debug!("push channel driver stopped");
    }

    /// Clean disconnect so the broker does not publish the last will.
    async fn close(&mut self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.client.try_disconnect().is_err() {
            return;
        }
        // Poll until the disconnect is flushed and the loop reports it.
        let flushed = tokio::time::timeout(Duration::from_secs(1), async {
            while self.eventloop.poll().await.is_ok() {}
        })
        .await;
        if flushed.is_err() {
            log::debug!("push channel disconnect timed out");
        }
    }
}
