use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debounce::{DEFAULT_EVENT_COOLDOWN, DEFAULT_VOTE_THRESHOLD};
use crate::decode::ProposalSettings;
use crate::registry::CameraSource;

const DEFAULT_DB_PATH: &str = "registry.db";
const DEFAULT_POLL_SECS: u64 = 10;
const DEFAULT_MQTT_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "scannerd";
const DEFAULT_TOPIC_PREFIX: &str = "scan";
const DEFAULT_RECONNECT_MS: u64 = 2000;
const DEFAULT_DEBUG_DIR: &str = "debug";

#[derive(Debug, Deserialize, Default)]
struct ScannerConfigFile {
    registry: Option<RegistryConfigFile>,
    mqtt: Option<MqttConfigFile>,
    capture: Option<CaptureConfigFile>,
    debounce: Option<DebounceConfigFile>,
    snapshots: Option<SnapshotConfigFile>,
    proposer: Option<ProposerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RegistryConfigFile {
    db_path: Option<String>,
    poll_interval_secs: Option<u64>,
    stations: Option<Vec<CameraSource>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: Option<String>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    read_interval_ms: Option<u64>,
    signal_loss_backoff_ms: Option<u64>,
    open_retry_ms: Option<u64>,
    fault_cooldown_ms: Option<u64>,
    warmup_frames: Option<u32>,
    decode_idle_ms: Option<u64>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DebounceConfigFile {
    vote_threshold: Option<u32>,
    cooldown_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    enabled: Option<bool>,
    dir: Option<PathBuf>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ProposerConfigFile {
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub registry: RegistrySettings,
    pub push: PushSettings,
    pub capture: CaptureSettings,
    pub debounce: DebounceSettings,
    pub snapshots: SnapshotSettings,
    pub proposer: ProposerSettings,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub db_path: String,
    pub poll_interval: Duration,
    /// Fixed station list; when present the SQLite registry is not used.
    pub stations: Option<Vec<CameraSource>>,
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub broker_addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub reconnect_delay: Duration,
}

impl PushSettings {
    /// Split `host:port`.
    pub fn broker_host_port(&self) -> Result<(String, u16)> {
        let (host, port) = self
            .broker_addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("mqtt broker_addr must be host:port"))?;
        if host.trim().is_empty() {
            return Err(anyhow!("mqtt broker_addr is missing a host"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow!("mqtt broker_addr has an invalid port: {}", port))?;
        Ok((host.to_string(), port))
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            broker_addr: DEFAULT_MQTT_ADDR.to_string(),
            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            username: None,
            password: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_MS),
        }
    }
}

/// Timing of the capture and decode loops.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Pause between successful reads.
    pub read_interval: Duration,
    /// Pause after an empty frame or read failure before reopening.
    pub signal_loss_backoff: Duration,
    /// Pause after a failed connection attempt.
    pub open_retry: Duration,
    /// Pause after an unexpected fault in the loop body.
    pub fault_cooldown: Duration,
    /// Stale frames discarded right after connecting.
    pub warmup_frames: u32,
    /// Decode loop sleep when the buffer is empty.
    pub decode_idle: Duration,
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            read_interval: Duration::from_millis(30),
            signal_loss_backoff: Duration::from_millis(1000),
            open_retry: Duration::from_millis(5000),
            fault_cooldown: Duration::from_millis(2000),
            warmup_frames: 5,
            decode_idle: Duration::from_millis(10),
            target_fps: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebounceSettings {
    pub vote_threshold: u32,
    pub cooldown: Duration,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            vote_threshold: DEFAULT_VOTE_THRESHOLD,
            cooldown: DEFAULT_EVENT_COOLDOWN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub font_path: Option<PathBuf>,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(DEFAULT_DEBUG_DIR),
            font_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProposerSettings {
    pub model_path: Option<PathBuf>,
    pub proposal: ProposalSettings,
}

impl ScannerConfig {
    /// Load from the file named by `SCANNER_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SCANNER_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ScannerConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ScannerConfigFile) -> Self {
        let registry = file.registry.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let debounce = file.debounce.unwrap_or_default();
        let snapshots = file.snapshots.unwrap_or_default();
        let proposer = file.proposer.unwrap_or_default();

        let push_defaults = PushSettings::default();
        let capture_defaults = CaptureSettings::default();
        let debounce_defaults = DebounceSettings::default();
        let snapshot_defaults = SnapshotSettings::default();
        let proposal_defaults = ProposalSettings::default();

        Self {
            registry: RegistrySettings {
                db_path: registry
                    .db_path
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                poll_interval: Duration::from_secs(
                    registry.poll_interval_secs.unwrap_or(DEFAULT_POLL_SECS),
                ),
                stations: registry.stations,
            },
            push: PushSettings {
                broker_addr: mqtt.broker_addr.unwrap_or(push_defaults.broker_addr),
                client_id: mqtt.client_id.unwrap_or(push_defaults.client_id),
                username: mqtt.username,
                password: mqtt.password,
                topic_prefix: mqtt.topic_prefix.unwrap_or(push_defaults.topic_prefix),
                reconnect_delay: mqtt
                    .reconnect_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(push_defaults.reconnect_delay),
            },
            capture: CaptureSettings {
                read_interval: millis_or(capture.read_interval_ms, capture_defaults.read_interval),
                signal_loss_backoff: millis_or(
                    capture.signal_loss_backoff_ms,
                    capture_defaults.signal_loss_backoff,
                ),
                open_retry: millis_or(capture.open_retry_ms, capture_defaults.open_retry),
                fault_cooldown: millis_or(
                    capture.fault_cooldown_ms,
                    capture_defaults.fault_cooldown,
                ),
                warmup_frames: capture
                    .warmup_frames
                    .unwrap_or(capture_defaults.warmup_frames),
                decode_idle: millis_or(capture.decode_idle_ms, capture_defaults.decode_idle),
                target_fps: capture.target_fps.unwrap_or(capture_defaults.target_fps),
            },
            debounce: DebounceSettings {
                vote_threshold: debounce
                    .vote_threshold
                    .unwrap_or(debounce_defaults.vote_threshold),
                cooldown: millis_or(debounce.cooldown_ms, debounce_defaults.cooldown),
            },
            snapshots: SnapshotSettings {
                enabled: snapshots.enabled.unwrap_or(snapshot_defaults.enabled),
                dir: snapshots.dir.unwrap_or(snapshot_defaults.dir),
                font_path: snapshots.font_path,
            },
            proposer: ProposerSettings {
                model_path: proposer.model_path,
                proposal: ProposalSettings {
                    input_size: proposer.input_size.unwrap_or(proposal_defaults.input_size),
                    confidence: proposer.confidence.unwrap_or(proposal_defaults.confidence),
                    iou: proposer.iou.unwrap_or(proposal_defaults.iou),
                },
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("SCANNER_DB_PATH") {
            self.registry.db_path = path;
        }
        if let Some(secs) = non_empty_env("SCANNER_POLL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("SCANNER_POLL_SECS must be an integer number of seconds")
            })?;
            self.registry.poll_interval = Duration::from_secs(secs);
        }
        if let Some(addr) = non_empty_env("SCANNER_MQTT_ADDR") {
            self.push.broker_addr = addr;
        }
        if let Some(id) = non_empty_env("SCANNER_MQTT_CLIENT_ID") {
            self.push.client_id = id;
        }
        if let Some(user) = non_empty_env("SCANNER_MQTT_USERNAME") {
            self.push.username = Some(user);
        }
        if let Some(password) = non_empty_env("SCANNER_MQTT_PASSWORD") {
            self.push.password = Some(password);
        }
        if let Some(prefix) = non_empty_env("SCANNER_TOPIC_PREFIX") {
            self.push.topic_prefix = prefix;
        }
        if let Some(dir) = non_empty_env("SCANNER_DEBUG_DIR") {
            self.snapshots.dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty_env("SCANNER_MODEL_PATH") {
            self.proposer.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.registry.poll_interval.is_zero() {
            return Err(anyhow!("registry poll interval must be greater than zero"));
        }
        self.push.broker_host_port()?;
        self.push.topic_prefix = self.push.topic_prefix.trim_end_matches('/').to_string();
        if self.push.topic_prefix.is_empty()
            || self.push.topic_prefix.contains(['#', '+'])
        {
            return Err(anyhow!(
                "mqtt topic_prefix must be non-empty and free of wildcards"
            ));
        }
        if self.push.reconnect_delay.is_zero() {
            return Err(anyhow!("mqtt reconnect delay must be greater than zero"));
        }
        if self.capture.open_retry.is_zero()
            || self.capture.signal_loss_backoff.is_zero()
            || self.capture.fault_cooldown.is_zero()
        {
            return Err(anyhow!("capture retry delays must be greater than zero"));
        }
        if self.capture.decode_idle.is_zero() {
            return Err(anyhow!("capture decode_idle_ms must be greater than zero"));
        }
        if self.debounce.vote_threshold == 0 {
            return Err(anyhow!("debounce vote_threshold must be at least 1"));
        }
        let proposal = &self.proposer.proposal;
        if proposal.input_size == 0 {
            return Err(anyhow!("proposer input_size must be greater than zero"));
        }
        for (name, value) in [("confidence", proposal.confidence), ("iou", proposal.iou)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("proposer {} must be in (0, 1], got {}", name, value));
            }
        }
        if let Some(stations) = &self.registry.stations {
            let mut ids: Vec<_> = stations.iter().map(|s| s.station_id).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != stations.len() {
                return Err(anyhow!("registry stations contain duplicate station_id values"));
            }
        }
        Ok(())
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<ScannerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
