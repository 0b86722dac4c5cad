//! Station/camera registry.
//!
//! The registry is owned by an external admin system; this service only
//! reads it. `SqliteRegistry` opens a fresh connection on every poll so that
//! edits made by the admin side are picked up without coordination.

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

pub type StationId = i64;

/// One station's QR camera as seen in a single registry poll.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CameraSource {
    pub station_id: StationId,
    pub station_name: String,
    pub uri: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CameraSource {
    /// Only enabled cameras with a connection URI get a pipeline.
    pub fn is_scannable(&self) -> bool {
        self.enabled && !self.uri.trim().is_empty()
    }
}

pub trait StationRegistry: Send + Sync {
    /// All stations that currently have a QR camera with a non-empty URI.
    fn load_stations(&self) -> Result<Vec<CameraSource>>;
}

// ----------------------------------------------------------------------------
// SQLite registry
// ----------------------------------------------------------------------------

const STATIONS_QUERY: &str = r#"
    SELECT s.id, s.name, c.rtsp_url, c.enabled
    FROM stations s
    JOIN cameras c ON c.id = s.qr_camera_id
    WHERE c.rtsp_url IS NOT NULL AND TRIM(c.rtsp_url) != ''
    ORDER BY s.id
"#;

pub struct SqliteRegistry {
    db_path: PathBuf,
}

impl SqliteRegistry {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Check that the database exists and carries the registry tables.
    /// Never creates anything: a missing file is an error.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self::new(db_path);
        let conn = registry.connect()?;
        conn.prepare(STATIONS_QUERY).with_context(|| {
            format!(
                "registry database {} has no station tables",
                registry.db_path.display()
            )
        })?;
        Ok(registry)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open registry database {}", self.db_path.display()))
    }
}

impl StationRegistry for SqliteRegistry {
    fn load_stations(&self) -> Result<Vec<CameraSource>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(STATIONS_QUERY)?;
        let rows = stmt.query_map([], |row| {
            Ok(CameraSource {
                station_id: row.get(0)?,
                station_name: row.get(1)?,
                uri: row.get::<_, String>(2)?.trim().to_string(),
                enabled: row.get::<_, i64>(3)? != 0,
            })
        })?;

        let mut stations = Vec::new();
        for row in rows {
            stations.push(row.context("read station row")?);
        }
        Ok(stations)
    }
}

// ----------------------------------------------------------------------------
// In-memory registry
// ----------------------------------------------------------------------------

/// Registry backed by a list held in memory (config-file deployments, tests).
#[derive(Default)]
pub struct StaticRegistry {
    stations: Mutex<Vec<CameraSource>>,
}

impl StaticRegistry {
    pub fn new(stations: Vec<CameraSource>) -> Self {
        Self {
            stations: Mutex::new(stations),
        }
    }

    /// Replace the whole station list, as a registry reload would.
    pub fn replace(&self, stations: Vec<CameraSource>) {
        *self.stations.lock().unwrap_or_else(PoisonError::into_inner) = stations;
    }
}

impl StationRegistry for StaticRegistry {
    fn load_stations(&self) -> Result<Vec<CameraSource>> {
        Ok(self
            .stations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| !s.uri.trim().is_empty())
            .cloned()
            .collect())
    }
}
