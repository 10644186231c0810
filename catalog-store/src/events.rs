//! Operational event log with short-window coalescing of repeats.

use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Row};

use crate::db::{now_secs, Catalog};
use crate::error::CatalogError;

/// How long two identical failures may be apart and still collapse into a
/// single row with an incremented count.
pub const COALESCE_WINDOW_SECS: i64 = 60;

/// Kind of operational event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StreamStarted,
    StreamStopped,
    RecordingStarted,
    RecordingStopped,
    RecordingFailed,
    RecordingCorrupt,
    SegmentOrphaned,
    RetentionDeleted,
    SourceError,
    CatalogError,
}

impl EventKind {
    pub fn as_i64(self) -> i64 {
        match self {
            EventKind::StreamStarted => 0,
            EventKind::StreamStopped => 1,
            EventKind::RecordingStarted => 2,
            EventKind::RecordingStopped => 3,
            EventKind::RecordingFailed => 4,
            EventKind::RecordingCorrupt => 5,
            EventKind::SegmentOrphaned => 6,
            EventKind::RetentionDeleted => 7,
            EventKind::SourceError => 8,
            EventKind::CatalogError => 9,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            0 => EventKind::StreamStarted,
            1 => EventKind::StreamStopped,
            2 => EventKind::RecordingStarted,
            3 => EventKind::RecordingStopped,
            4 => EventKind::RecordingFailed,
            5 => EventKind::RecordingCorrupt,
            6 => EventKind::SegmentOrphaned,
            7 => EventKind::RetentionDeleted,
            8 => EventKind::SourceError,
            9 => EventKind::CatalogError,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::StreamStarted => "stream_started",
            EventKind::StreamStopped => "stream_stopped",
            EventKind::RecordingStarted => "recording_started",
            EventKind::RecordingStopped => "recording_stopped",
            EventKind::RecordingFailed => "recording_failed",
            EventKind::RecordingCorrupt => "recording_corrupt",
            EventKind::SegmentOrphaned => "segment_orphaned",
            EventKind::RetentionDeleted => "retention_deleted",
            EventKind::SourceError => "source_error",
            EventKind::CatalogError => "catalog_error",
        }
    }
}

/// A stored event row.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub kind: EventKind,
    pub stream_name: Option<String>,
    pub message: String,
    pub file_path: Option<String>,
    /// Number of identical occurrences coalesced into this row.
    pub count: u32,
    pub created_at: i64,
}

/// Filter for [`Catalog::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub kind: Option<EventKind>,
    pub stream_name: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<u32>,
}

fn row_to_event(row: &Row) -> Result<Event, rusqlite::Error> {
    let kind_raw: i64 = row.get(1)?;
    Ok(Event {
        id: row.get(0)?,
        kind: EventKind::from_i64(kind_raw).unwrap_or(EventKind::CatalogError),
        stream_name: row.get(2)?,
        message: row.get(3)?,
        file_path: row.get(4)?,
        count: row.get::<_, i64>(5)? as u32,
        created_at: row.get(6)?,
    })
}

impl Catalog {
    /// Record an event. A repeat of the most recent row with the same kind,
    /// stream and message inside [`COALESCE_WINDOW_SECS`] bumps that row's
    /// count instead of inserting a new one.
    pub fn log_event(
        &self,
        kind: EventKind,
        stream_name: Option<&str>,
        message: &str,
        file_path: Option<&str>,
    ) -> Result<i64, CatalogError> {
        let conn = self.lock();
        let now = now_secs();

        let recent: Option<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM events
                 WHERE type = ?1 AND stream_name IS ?2 AND message = ?3 AND created_at >= ?4
                 ORDER BY id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(params![
                kind.as_i64(),
                stream_name,
                message,
                now - COALESCE_WINDOW_SECS
            ])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        if let Some(id) = recent {
            conn.execute("UPDATE events SET count = count + 1 WHERE id = ?1", [id])?;
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO events (type, stream_name, message, file_path, count, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![kind.as_i64(), stream_name, message, file_path, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>, CatalogError> {
        let mut sql = "SELECT id, type, stream_name, message, file_path, count, created_at
             FROM events WHERE 1 = 1"
            .to_string();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(kind) = query.kind {
            sql.push_str(" AND type = ?");
            args.push(Box::new(kind.as_i64()));
        }
        if let Some(ref name) = query.stream_name {
            sql.push_str(" AND stream_name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(since) = query.since {
            sql.push_str(" AND created_at >= ?");
            args.push(Box::new(since));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            row_to_event(row)
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Drop events older than the cutoff. Returns the number removed.
    pub fn prune_events(&self, older_than: i64) -> Result<usize, CatalogError> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM events WHERE created_at < ?1", [older_than])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_list() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .log_event(
                EventKind::RecordingStarted,
                Some("cam-front"),
                "recording started",
                None,
            )
            .unwrap();
        catalog
            .log_event(
                EventKind::SegmentOrphaned,
                Some("cam-front"),
                "segment file missing",
                Some("/rec/a.mp4"),
            )
            .unwrap();

        let all = catalog.list_events(&EventQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, EventKind::SegmentOrphaned);
        assert_eq!(all[0].file_path.as_deref(), Some("/rec/a.mp4"));

        let orphans = catalog
            .list_events(&EventQuery {
                kind: Some(EventKind::SegmentOrphaned),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn test_identical_failures_coalesce() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = catalog
            .log_event(EventKind::SourceError, Some("cam"), "read timed out", None)
            .unwrap();
        let b = catalog
            .log_event(EventKind::SourceError, Some("cam"), "read timed out", None)
            .unwrap();
        assert_eq!(a, b);

        let events = catalog.list_events(&EventQuery::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].count, 2);
    }

    #[test]
    fn test_different_messages_do_not_coalesce() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .log_event(EventKind::SourceError, Some("cam"), "read timed out", None)
            .unwrap();
        catalog
            .log_event(EventKind::SourceError, Some("cam"), "connection refused", None)
            .unwrap();
        assert_eq!(catalog.list_events(&EventQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_prune() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .log_event(EventKind::StreamStarted, Some("cam"), "started", None)
            .unwrap();
        let removed = catalog.prune_events(crate::db::now_secs() + 10).unwrap();
        assert_eq!(removed, 1);
        assert!(catalog.list_events(&EventQuery::default()).unwrap().is_empty());
    }
}
