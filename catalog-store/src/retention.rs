//! Per-stream retention policy rows, stored in `motion_recording_config`.

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::db::{now_secs, Catalog};
use crate::error::CatalogError;

/// Retention and motion-recording parameters for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub stream_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_buffer")]
    pub pre_buffer_seconds: u32,
    #[serde(default = "default_buffer")]
    pub post_buffer_seconds: u32,
    #[serde(default = "default_max_file_duration")]
    pub max_file_duration: u32,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_quality")]
    pub quality: String,
    /// Maximum segment age in days. Zero disables the age rule.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Maximum total bytes per stream, in megabytes. Zero means unlimited.
    #[serde(default)]
    pub max_storage_mb: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_buffer() -> u32 {
    5
}
fn default_max_file_duration() -> u32 {
    300
}
fn default_codec() -> String {
    "h264".to_string()
}
fn default_quality() -> String {
    "medium".to_string()
}
fn default_retention_days() -> u32 {
    7
}

impl RetentionPolicy {
    pub fn for_stream(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            enabled: true,
            pre_buffer_seconds: default_buffer(),
            post_buffer_seconds: default_buffer(),
            max_file_duration: default_max_file_duration(),
            codec: default_codec(),
            quality: default_quality(),
            retention_days: default_retention_days(),
            max_storage_mb: 0,
        }
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.max_storage_mb * 1024 * 1024
    }
}

fn row_to_policy(row: &Row) -> Result<RetentionPolicy, rusqlite::Error> {
    Ok(RetentionPolicy {
        stream_name: row.get(0)?,
        enabled: row.get::<_, i64>(1)? != 0,
        pre_buffer_seconds: row.get::<_, i64>(2)? as u32,
        post_buffer_seconds: row.get::<_, i64>(3)? as u32,
        max_file_duration: row.get::<_, i64>(4)? as u32,
        codec: row.get(5)?,
        quality: row.get(6)?,
        retention_days: row.get::<_, i64>(7)? as u32,
        max_storage_mb: row.get::<_, i64>(8)? as u64,
    })
}

const POLICY_COLUMNS: &str = "stream_name, enabled, pre_buffer_seconds, post_buffer_seconds, \
     max_file_duration, codec, quality, retention_days, max_storage_mb";

impl Catalog {
    /// Insert or replace the retention policy for a stream.
    pub fn set_retention_policy(&self, policy: &RetentionPolicy) -> Result<(), CatalogError> {
        let conn = self.lock();
        let now = now_secs();
        conn.execute(
            "INSERT INTO motion_recording_config
                 (stream_name, enabled, pre_buffer_seconds, post_buffer_seconds,
                  max_file_duration, codec, quality, retention_days, max_storage_mb,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(stream_name) DO UPDATE SET
                 enabled = excluded.enabled,
                 pre_buffer_seconds = excluded.pre_buffer_seconds,
                 post_buffer_seconds = excluded.post_buffer_seconds,
                 max_file_duration = excluded.max_file_duration,
                 codec = excluded.codec,
                 quality = excluded.quality,
                 retention_days = excluded.retention_days,
                 max_storage_mb = excluded.max_storage_mb,
                 updated_at = excluded.updated_at",
            params![
                policy.stream_name,
                policy.enabled as i64,
                policy.pre_buffer_seconds,
                policy.post_buffer_seconds,
                policy.max_file_duration,
                policy.codec,
                policy.quality,
                policy.retention_days,
                policy.max_storage_mb as i64,
                now,
            ],
        )?;
        Ok(())
    }

    /// Policy for a stream, or None when the stream has no dedicated row.
    pub fn get_retention_policy(
        &self,
        stream_name: &str,
    ) -> Result<Option<RetentionPolicy>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POLICY_COLUMNS} FROM motion_recording_config WHERE stream_name = ?1"
        ))?;
        let mut rows = stmt.query([stream_name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_policy(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POLICY_COLUMNS} FROM motion_recording_config ORDER BY stream_name"
        ))?;
        let rows = stmt.query_map([], |row| row_to_policy(row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_retention_policy(&self, stream_name: &str) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM motion_recording_config WHERE stream_name = ?1",
            [stream_name],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut policy = RetentionPolicy::for_stream("cam-lobby");
        policy.retention_days = 30;
        policy.max_storage_mb = 100;
        catalog.set_retention_policy(&policy).unwrap();

        let got = catalog.get_retention_policy("cam-lobby").unwrap().unwrap();
        assert_eq!(got, policy);
        assert_eq!(got.max_storage_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_replace_updates_fields() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .set_retention_policy(&RetentionPolicy::for_stream("cam"))
            .unwrap();

        let mut policy = RetentionPolicy::for_stream("cam");
        policy.retention_days = 1;
        catalog.set_retention_policy(&policy).unwrap();

        let got = catalog.get_retention_policy("cam").unwrap().unwrap();
        assert_eq!(got.retention_days, 1);
        assert_eq!(catalog.list_retention_policies().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_policy_is_none() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.get_retention_policy("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete_policy() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .set_retention_policy(&RetentionPolicy::for_stream("cam"))
            .unwrap();
        catalog.delete_retention_policy("cam").unwrap();
        assert!(catalog.get_retention_policy("cam").unwrap().is_none());
    }
}
