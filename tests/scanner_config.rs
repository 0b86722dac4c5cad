use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use station_scanner::config::ScannerConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SCANNER_CONFIG",
        "SCANNER_DB_PATH",
        "SCANNER_MQTT_ADDR",
        "SCANNER_MQTT_CLIENT_ID",
        "SCANNER_MQTT_USERNAME",
        "SCANNER_MQTT_PASSWORD",
        "SCANNER_TOPIC_PREFIX",
        "SCANNER_POLL_SECS",
        "SCANNER_DEBUG_DIR",
        "SCANNER_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "registry": {
                "db_path": "/var/lib/scanner/registry.db",
                "poll_interval_secs": 30
            },
            "mqtt": {
                "broker_addr": "broker.local:1883",
                "client_id": "scanner-hall-a",
                "topic_prefix": "hall-a/"
            },
            "capture": {
                "read_interval_ms": 40,
                "warmup_frames": 8
            },
            "debounce": {
                "vote_threshold": 3,
                "cooldown_ms": 5000
            },
            "snapshots": {
                "enabled": false,
                "dir": "/tmp/scans"
            },
            "proposer": {
                "confidence": 0.6
            }
        }"#,
    );

    std::env::set_var("SCANNER_CONFIG", file.path());
    std::env::set_var("SCANNER_MQTT_ADDR", "10.0.0.5:8883");
    std::env::set_var("SCANNER_POLL_SECS", "15");
    std::env::set_var("SCANNER_MODEL_PATH", "/models/qr.onnx");

    let cfg = ScannerConfig::load().expect("load config");

    assert_eq!(cfg.registry.db_path, "/var/lib/scanner/registry.db");
    assert_eq!(cfg.registry.poll_interval, Duration::from_secs(15));
    assert!(cfg.registry.stations.is_none());
    assert_eq!(cfg.push.broker_addr, "10.0.0.5:8883");
    assert_eq!(cfg.push.client_id, "scanner-hall-a");
    assert_eq!(cfg.push.topic_prefix, "hall-a");
    assert_eq!(cfg.capture.read_interval, Duration::from_millis(40));
    assert_eq!(cfg.capture.warmup_frames, 8);
    assert_eq!(cfg.capture.open_retry, Duration::from_secs(5));
    assert_eq!(cfg.debounce.vote_threshold, 3);
    assert_eq!(cfg.debounce.cooldown, Duration::from_millis(5000));
    assert!(!cfg.snapshots.enabled);
    assert_eq!(cfg.snapshots.dir, PathBuf::from("/tmp/scans"));
    assert_eq!(cfg.proposer.proposal.confidence, 0.6);
    assert_eq!(cfg.proposer.proposal.iou, 0.45);
    assert_eq!(
        cfg.proposer.model_path,
        Some(PathBuf::from("/models/qr.onnx"))
    );

    clear_env();
}

#[test]
fn static_station_list_is_read_from_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "registry": {
                "stations": [
                    { "station_id": 1, "station_name": "Dock 1", "uri": "rtsp://10.0.0.21/live" },
                    { "station_id": 2, "station_name": "Dock 2", "uri": "stub://dock2", "enabled": false }
                ]
            }
        }"#,
    );

    let cfg = ScannerConfig::load_from(Some(file.path())).expect("load config");
    let stations = cfg.registry.stations.expect("static stations");
    assert_eq!(stations.len(), 2);
    assert!(stations[0].enabled);
    assert_eq!(stations[0].uri, "rtsp://10.0.0.21/live");
    assert!(!stations[1].enabled);

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ScannerConfig::load().expect("load defaults");
    assert_eq!(cfg.registry.db_path, "registry.db");
    assert_eq!(cfg.registry.poll_interval, Duration::from_secs(10));
    assert_eq!(cfg.push.broker_addr, "127.0.0.1:1883");
    assert_eq!(cfg.push.topic_prefix, "scan");
    assert_eq!(cfg.push.reconnect_delay, Duration::from_millis(2000));
    assert_eq!(cfg.debounce.vote_threshold, 2);
    assert!(cfg.snapshots.enabled);
    assert_eq!(cfg.snapshots.dir, PathBuf::from("debug"));

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SCANNER_POLL_SECS", "0");
    assert!(ScannerConfig::load().is_err());

    std::env::set_var("SCANNER_POLL_SECS", "ten");
    assert!(ScannerConfig::load().is_err());
    std::env::remove_var("SCANNER_POLL_SECS");

    std::env::set_var("SCANNER_MQTT_ADDR", "no-port-here");
    assert!(ScannerConfig::load().is_err());
    std::env::remove_var("SCANNER_MQTT_ADDR");

    let file = write_config(r#"{ "debounce": { "vote_threshold": 0 } }"#);
    assert!(ScannerConfig::load_from(Some(file.path())).is_err());

    let file = write_config(r#"{ "capture": { "decode_idle_ms": 0 } }"#);
    assert!(ScannerConfig::load_from(Some(file.path())).is_err());

    let file = write_config(
        r#"{
            "registry": {
                "stations": [
                    { "station_id": 1, "station_name": "A", "uri": "stub://a" },
                    { "station_id": 1, "station_name": "B", "uri": "stub://b" }
                ]
            }
        }"#,
    );
    assert!(ScannerConfig::load_from(Some(file.path())).is_err());

    let file = write_config("{ not json");
    assert!(ScannerConfig::load_from(Some(file.path())).is_err());

    clear_env();
}
