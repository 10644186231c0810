//! Stream configuration rows.

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::Catalog;
use crate::error::CatalogError;

/// Longest stream name accepted, in bytes.
pub const MAX_STREAM_NAME_LEN: usize = 63;

/// Transport used to pull frames from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    TcpPull,
    UdpPull,
    Onvif,
}

impl Protocol {
    pub fn as_i64(self) -> i64 {
        match self {
            Protocol::TcpPull => 0,
            Protocol::UdpPull => 1,
            Protocol::Onvif => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Protocol::UdpPull,
            2 => Protocol::Onvif,
            _ => Protocol::TcpPull,
        }
    }
}

/// Configuration for one camera stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_true")]
    pub record: bool,
    /// Target segment length in seconds. Zero is invalid.
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default)]
    pub detection_based_recording: bool,
    #[serde(default)]
    pub detection_model: String,
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f32,
    #[serde(default = "default_detection_interval")]
    pub detection_interval: u32,
    /// Pre-roll seconds buffered before a trigger. Zero disables pre-roll.
    #[serde(default)]
    pub pre_detection_buffer: u32,
    #[serde(default = "default_post_buffer")]
    pub post_detection_buffer: u32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub is_onvif: bool,
    #[serde(default)]
    pub record_audio: bool,
}

fn default_true() -> bool {
    true
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_fps() -> u32 {
    30
}
fn default_codec() -> String {
    "h264".to_string()
}
fn default_priority() -> u8 {
    5
}
fn default_segment_duration() -> u32 {
    900
}
fn default_detection_threshold() -> f32 {
    0.5
}
fn default_detection_interval() -> u32 {
    10
}
fn default_post_buffer() -> u32 {
    5
}

impl StreamConfig {
    /// Minimal config with defaults for everything but name and URL.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled: true,
            streaming_enabled: true,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            codec: default_codec(),
            priority: default_priority(),
            record: true,
            segment_duration: default_segment_duration(),
            detection_based_recording: false,
            detection_model: String::new(),
            detection_threshold: default_detection_threshold(),
            detection_interval: default_detection_interval(),
            pre_detection_buffer: 0,
            post_detection_buffer: default_post_buffer(),
            protocol: Protocol::TcpPull,
            is_onvif: false,
            record_audio: false,
        }
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.name.is_empty() || self.name.len() > MAX_STREAM_NAME_LEN {
            return Err(CatalogError::InvalidName(self.name.clone()));
        }
        if !self.name.chars().all(|c| c.is_ascii_graphic()) {
            return Err(CatalogError::InvalidName(self.name.clone()));
        }
        if self.segment_duration == 0 {
            return Err(CatalogError::Conflict(format!(
                "stream {}: segment_duration must be at least 1 second",
                self.name
            )));
        }
        Ok(())
    }
}

fn row_to_config(row: &Row) -> Result<StreamConfig, rusqlite::Error> {
    Ok(StreamConfig {
        name: row.get(0)?,
        url: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        streaming_enabled: row.get::<_, i64>(3)? != 0,
        width: row.get::<_, i64>(4)? as u32,
        height: row.get::<_, i64>(5)? as u32,
        fps: row.get::<_, i64>(6)? as u32,
        codec: row.get(7)?,
        priority: row.get::<_, i64>(8)? as u8,
        record: row.get::<_, i64>(9)? != 0,
        segment_duration: row.get::<_, i64>(10)? as u32,
        detection_based_recording: row.get::<_, i64>(11)? != 0,
        detection_model: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        detection_threshold: row.get::<_, Option<f64>>(13)?.unwrap_or(0.5) as f32,
        detection_interval: row.get::<_, Option<i64>>(14)?.unwrap_or(10) as u32,
        pre_detection_buffer: row.get::<_, Option<i64>>(15)?.unwrap_or(0) as u32,
        post_detection_buffer: row.get::<_, Option<i64>>(16)?.unwrap_or(5) as u32,
        protocol: Protocol::from_i64(row.get::<_, Option<i64>>(17)?.unwrap_or(0)),
        is_onvif: row.get::<_, Option<i64>>(18)?.unwrap_or(0) != 0,
        record_audio: row.get::<_, Option<i64>>(19)?.unwrap_or(0) != 0,
    })
}

const STREAM_COLUMNS: &str = "name, url, enabled, streaming_enabled, width, height, fps, codec, \
     priority, record, segment_duration, detection_based_recording, detection_model, \
     detection_threshold, detection_interval, pre_detection_buffer, post_detection_buffer, \
     protocol, is_onvif, record_audio";

impl Catalog {
    /// Insert or replace a stream configuration by name.
    ///
    /// If a row with the same name already exists (including a soft-deleted
    /// one), every field is replaced with the new values, which re-enables a
    /// disabled stream when `config.enabled` is set. Returns the row id.
    pub fn upsert_stream(&self, config: &StreamConfig) -> Result<i64, CatalogError> {
        config.validate()?;
        let conn = self.lock();

        let existing: Option<i64> = {
            let mut stmt = conn.prepare("SELECT id FROM streams WHERE name = ?1")?;
            let mut rows = stmt.query([&config.name])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        if let Some(id) = existing {
            conn.execute(
                "UPDATE streams SET
                     url = ?1, enabled = ?2, streaming_enabled = ?3, width = ?4, height = ?5,
                     fps = ?6, codec = ?7, priority = ?8, record = ?9, segment_duration = ?10,
                     detection_based_recording = ?11, detection_model = ?12,
                     detection_threshold = ?13, detection_interval = ?14,
                     pre_detection_buffer = ?15, post_detection_buffer = ?16,
                     protocol = ?17, is_onvif = ?18, record_audio = ?19
                 WHERE id = ?20",
                params![
                    config.url,
                    config.enabled as i64,
                    config.streaming_enabled as i64,
                    config.width,
                    config.height,
                    config.fps,
                    config.codec,
                    config.priority,
                    config.record as i64,
                    config.segment_duration,
                    config.detection_based_recording as i64,
                    config.detection_model,
                    config.detection_threshold as f64,
                    config.detection_interval,
                    config.pre_detection_buffer,
                    config.post_detection_buffer,
                    config.protocol.as_i64(),
                    config.is_onvif as i64,
                    config.record_audio as i64,
                    id,
                ],
            )?;
            info!(stream = %config.name, id, "stream configuration replaced");
            return Ok(id);
        }

        conn.execute(
            &format!(
                "INSERT INTO streams ({STREAM_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                config.name,
                config.url,
                config.enabled as i64,
                config.streaming_enabled as i64,
                config.width,
                config.height,
                config.fps,
                config.codec,
                config.priority,
                config.record as i64,
                config.segment_duration,
                config.detection_based_recording as i64,
                config.detection_model,
                config.detection_threshold as f64,
                config.detection_interval,
                config.pre_detection_buffer,
                config.post_detection_buffer,
                config.protocol.as_i64(),
                config.is_onvif as i64,
                config.record_audio as i64,
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(stream = %config.name, id, "stream configuration added");
        Ok(id)
    }

    pub fn get_stream(&self, name: &str) -> Result<Option<StreamConfig>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams WHERE name = ?1"
        ))?;
        let mut rows = stmt.query([name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_config(row)?)),
            None => Ok(None),
        }
    }

    /// All stream rows, enabled and disabled, ordered by name.
    pub fn list_streams(&self) -> Result<Vec<StreamConfig>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams ORDER BY name"
        ))?;
        let rows = stmt.query_map([], |row| row_to_config(row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Replace the configuration of an existing stream.
    pub fn update_stream(&self, name: &str, config: &StreamConfig) -> Result<(), CatalogError> {
        config.validate()?;
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE streams SET
                 name = ?1, url = ?2, enabled = ?3, streaming_enabled = ?4, width = ?5,
                 height = ?6, fps = ?7, codec = ?8, priority = ?9, record = ?10,
                 segment_duration = ?11, detection_based_recording = ?12, detection_model = ?13,
                 detection_threshold = ?14, detection_interval = ?15,
                 pre_detection_buffer = ?16, post_detection_buffer = ?17,
                 protocol = ?18, is_onvif = ?19, record_audio = ?20
             WHERE name = ?21",
            params![
                config.name,
                config.url,
                config.enabled as i64,
                config.streaming_enabled as i64,
                config.width,
                config.height,
                config.fps,
                config.codec,
                config.priority,
                config.record as i64,
                config.segment_duration,
                config.detection_based_recording as i64,
                config.detection_model,
                config.detection_threshold as f64,
                config.detection_interval,
                config.pre_detection_buffer,
                config.post_detection_buffer,
                config.protocol.as_i64(),
                config.is_onvif as i64,
                config.record_audio as i64,
                name,
            ],
        )?;
        if updated == 0 {
            return Err(CatalogError::StreamNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Disable a stream, retaining its history.
    pub fn soft_delete_stream(&self, name: &str) -> Result<(), CatalogError> {
        let conn = self.lock();
        let updated = conn.execute("UPDATE streams SET enabled = 0 WHERE name = ?1", [name])?;
        if updated == 0 {
            return Err(CatalogError::StreamNotFound(name.to_string()));
        }
        info!(stream = name, "stream soft-deleted");
        Ok(())
    }

    /// Remove the stream row entirely. Segment rows keep their dangling
    /// owner name and age out through retention.
    pub fn hard_delete_stream(&self, name: &str) -> Result<(), CatalogError> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM streams WHERE name = ?1", [name])?;
        if deleted == 0 {
            return Err(CatalogError::StreamNotFound(name.to_string()));
        }
        info!(stream = name, "stream hard-deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> StreamConfig {
        StreamConfig::new(name, format!("tcp://camera/{name}"))
    }

    #[test]
    fn test_upsert_and_get() {
        let catalog = Catalog::open_in_memory().unwrap();
        let id = catalog.upsert_stream(&cfg("cam-front")).unwrap();
        assert!(id > 0);

        let got = catalog.get_stream("cam-front").unwrap().unwrap();
        assert_eq!(got.url, "tcp://camera/cam-front");
        assert_eq!(got.segment_duration, 900);
        assert!(got.enabled);
    }

    #[test]
    fn test_upsert_replaces_all_fields() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert_stream(&cfg("cam-front")).unwrap();

        let mut updated = cfg("cam-front");
        updated.fps = 15;
        updated.segment_duration = 60;
        updated.record_audio = true;
        let id2 = catalog.upsert_stream(&updated).unwrap();

        let got = catalog.get_stream("cam-front").unwrap().unwrap();
        assert_eq!(got.fps, 15);
        assert_eq!(got.segment_duration, 60);
        assert!(got.record_audio);
        assert_eq!(catalog.list_streams().unwrap().len(), 1);
        assert!(id2 > 0);
    }

    #[test]
    fn test_upsert_reenables_soft_deleted() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert_stream(&cfg("cam-door")).unwrap();
        catalog.soft_delete_stream("cam-door").unwrap();
        assert!(!catalog.get_stream("cam-door").unwrap().unwrap().enabled);

        catalog.upsert_stream(&cfg("cam-door")).unwrap();
        assert!(catalog.get_stream("cam-door").unwrap().unwrap().enabled);
    }

    #[test]
    fn test_list_tracks_last_upsert_and_deletes() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert_stream(&cfg("a")).unwrap();
        catalog.upsert_stream(&cfg("b")).unwrap();
        catalog.upsert_stream(&cfg("c")).unwrap();

        catalog.soft_delete_stream("b").unwrap();
        let names: Vec<_> = catalog
            .list_streams()
            .unwrap()
            .into_iter()
            .map(|s| (s.name, s.enabled))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), true)
            ]
        );

        catalog.hard_delete_stream("b").unwrap();
        assert_eq!(catalog.list_streams().unwrap().len(), 2);
        assert!(catalog.get_stream("b").unwrap().is_none());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.upsert_stream(&cfg("")).is_err());
        assert!(catalog.upsert_stream(&cfg(&"x".repeat(64))).is_err());
        assert!(catalog.upsert_stream(&cfg("cam with spaces")).is_err());
    }

    #[test]
    fn test_zero_segment_duration_rejected() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut config = cfg("cam-front");
        config.segment_duration = 0;
        assert!(catalog.upsert_stream(&config).is_err());
    }

    #[test]
    fn test_update_missing_stream() {
        let catalog = Catalog::open_in_memory().unwrap();
        let err = catalog.update_stream("ghost", &cfg("ghost")).unwrap_err();
        assert!(matches!(err, CatalogError::StreamNotFound(_)));
    }

    #[test]
    fn test_protocol_roundtrip() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut config = cfg("cam-udp");
        config.protocol = Protocol::UdpPull;
        catalog.upsert_stream(&config).unwrap();
        let got = catalog.get_stream("cam-udp").unwrap().unwrap();
        assert_eq!(got.protocol, Protocol::UdpPull);
    }
}
