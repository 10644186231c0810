//! Segment metadata rows, one per produced container file.

use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Row};
use tracing::debug;

use crate::db::{now_secs, Catalog};
use crate::error::CatalogError;

/// Metadata for one recording segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub id: i64,
    pub stream_name: String,
    pub file_path: String,
    /// Seconds since the UNIX epoch, UTC.
    pub start_time: i64,
    /// None while the segment is still being written.
    pub end_time: Option<i64>,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: String,
    pub is_complete: bool,
    pub created_at: i64,
}

/// Sort order for segment listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentOrder {
    #[default]
    StartAsc,
    StartDesc,
}

/// Filter for [`Catalog::list_segments`] / [`Catalog::count_segments`].
#[derive(Debug, Clone, Default)]
pub struct SegmentQuery {
    pub stream_name: Option<String>,
    /// Only segments overlapping `[range_start, range_end]`.
    pub range_start: Option<i64>,
    pub range_end: Option<i64>,
    /// Only completed segments.
    pub complete_only: bool,
    pub order: SegmentOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl SegmentQuery {
    pub fn stream(name: impl Into<String>) -> Self {
        Self {
            stream_name: Some(name.into()),
            ..Self::default()
        }
    }

    fn where_clause(&self, sql: &mut String, args: &mut Vec<Box<dyn ToSql>>) {
        sql.push_str(" WHERE 1 = 1");
        if self.complete_only {
            sql.push_str(" AND is_complete = 1");
        }
        if let Some(ref name) = self.stream_name {
            sql.push_str(" AND stream_name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(t0) = self.range_start {
            sql.push_str(" AND (end_time >= ? OR end_time IS NULL)");
            args.push(Box::new(t0));
        }
        if let Some(t1) = self.range_end {
            sql.push_str(" AND start_time <= ?");
            args.push(Box::new(t1));
        }
    }
}

const SEGMENT_COLUMNS: &str = "id, stream_name, file_path, start_time, end_time, size_bytes, \
     width, height, fps, codec, is_complete, created_at";

fn row_to_segment(row: &Row) -> Result<SegmentRecord, rusqlite::Error> {
    Ok(SegmentRecord {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        file_path: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)? as u64,
        width: row.get::<_, Option<i64>>(6)?.unwrap_or(0) as u32,
        height: row.get::<_, Option<i64>>(7)?.unwrap_or(0) as u32,
        fps: row.get::<_, Option<i64>>(8)?.unwrap_or(0) as u32,
        codec: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        is_complete: row.get::<_, i64>(10)? != 0,
        created_at: row.get(11)?,
    })
}

impl Catalog {
    /// Next segment id that an insert would receive, so callers can embed it
    /// in the file name before the row exists.
    pub fn next_segment_id(&self) -> Result<i64, CatalogError> {
        let conn = self.lock();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM segments", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Register a segment that has just been opened for writing.
    ///
    /// The row is inserted with `is_complete = 0` and a NULL end time; the
    /// path carries a UNIQUE constraint.
    #[allow(clippy::too_many_arguments)]
    pub fn open_segment(
        &self,
        stream_name: &str,
        file_path: &str,
        start_time: i64,
        width: u32,
        height: u32,
        fps: u32,
        codec: &str,
    ) -> Result<i64, CatalogError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO segments
                 (stream_name, file_path, start_time, end_time, size_bytes,
                  width, height, fps, codec, is_complete, created_at)
             VALUES (?1, ?2, ?3, NULL, 0, ?4, ?5, ?6, ?7, 0, ?8)",
            params![stream_name, file_path, start_time, width, height, fps, codec, now_secs()],
        )?;
        let id = conn.last_insert_rowid();
        debug!(stream = stream_name, id, path = file_path, "segment opened");
        Ok(id)
    }

    /// Mark the segment at `file_path` complete. Applied exactly once per
    /// segment, after the file has been fsynced and renamed into place.
    pub fn close_segment(
        &self,
        file_path: &str,
        end_time: i64,
        size_bytes: u64,
    ) -> Result<(), CatalogError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE segments SET end_time = ?1, size_bytes = ?2, is_complete = 1
             WHERE file_path = ?3",
            params![end_time, size_bytes as i64, file_path],
        )?;
        if updated == 0 {
            return Err(CatalogError::SegmentNotFound(file_path.to_string()));
        }
        Ok(())
    }

    pub fn get_segment(&self, id: i64) -> Result<Option<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE id = ?1"
        ))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_segment(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_segment_by_path(&self, path: &str) -> Result<Option<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE file_path = ?1"
        ))?;
        let mut rows = stmt.query([path])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_segment(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_segments(&self, query: &SegmentQuery) -> Result<Vec<SegmentRecord>, CatalogError> {
        let mut sql = format!("SELECT {SEGMENT_COLUMNS} FROM segments");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        query.where_clause(&mut sql, &mut args);
        sql.push_str(match query.order {
            SegmentOrder::StartAsc => " ORDER BY start_time ASC, id ASC",
            SegmentOrder::StartDesc => " ORDER BY start_time DESC, id DESC",
        });
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit));
            if let Some(offset) = query.offset {
                sql.push_str(" OFFSET ?");
                args.push(Box::new(offset));
            }
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            row_to_segment(row)
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_segments(&self, query: &SegmentQuery) -> Result<u64, CatalogError> {
        let mut sql = "SELECT COUNT(*) FROM segments".to_string();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        query.where_clause(&mut sql, &mut args);

        let conn = self.lock();
        let count: i64 = conn.query_row(
            &sql,
            params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Remove the catalog row only; the caller owns the file unlink.
    pub fn delete_segment(&self, id: i64) -> Result<(), CatalogError> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM segments WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(CatalogError::SegmentNotFound(format!("id {id}")));
        }
        Ok(())
    }

    pub fn total_size_bytes(&self, stream_name: Option<&str>) -> Result<u64, CatalogError> {
        let conn = self.lock();
        let total: i64 = match stream_name {
            Some(name) => conn.query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM segments WHERE stream_name = ?1",
                [name],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM segments",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(total as u64)
    }

    /// Complete segments that ended before `cutoff`, oldest first.
    pub fn expired_segments(
        &self,
        stream_name: &str,
        cutoff: i64,
    ) -> Result<Vec<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments
             WHERE stream_name = ?1 AND is_complete = 1 AND end_time < ?2
             ORDER BY end_time ASC"
        ))?;
        let rows = stmt.query_map(params![stream_name, cutoff], |row| row_to_segment(row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Oldest complete segments for a stream, for quota enforcement.
    pub fn oldest_complete_segments(
        &self,
        stream_name: &str,
        limit: u32,
    ) -> Result<Vec<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments
             WHERE stream_name = ?1 AND is_complete = 1
             ORDER BY start_time ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![stream_name, limit], |row| row_to_segment(row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Segments never marked complete, left behind by a crash.
    pub fn incomplete_segments(&self) -> Result<Vec<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE is_complete = 0 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], |row| row_to_segment(row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_one(catalog: &Catalog, stream: &str, path: &str, start: i64) -> i64 {
        catalog
            .open_segment(stream, path, start, 1280, 720, 10, "h264")
            .unwrap()
    }

    #[test]
    fn test_open_then_close() {
        let catalog = Catalog::open_in_memory().unwrap();
        let id = open_one(&catalog, "cam-front", "/rec/a.mp4", 1000);

        let open = catalog.get_segment(id).unwrap().unwrap();
        assert!(!open.is_complete);
        assert_eq!(open.end_time, None);
        assert_eq!(open.size_bytes, 0);

        catalog.close_segment("/rec/a.mp4", 1060, 4096).unwrap();
        let closed = catalog.get_segment(id).unwrap().unwrap();
        assert!(closed.is_complete);
        assert_eq!(closed.end_time, Some(1060));
        assert_eq!(closed.size_bytes, 4096);
    }

    #[test]
    fn test_duplicate_path_conflicts() {
        let catalog = Catalog::open_in_memory().unwrap();
        open_one(&catalog, "cam-front", "/rec/a.mp4", 1000);
        let err = catalog
            .open_segment("cam-front", "/rec/a.mp4", 2000, 1280, 720, 10, "h264")
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_next_segment_id_monotone() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert_eq!(catalog.next_segment_id().unwrap(), 1);
        open_one(&catalog, "cam-front", "/rec/a.mp4", 1000);
        assert_eq!(catalog.next_segment_id().unwrap(), 2);
    }

    #[test]
    fn test_list_with_range_and_order() {
        let catalog = Catalog::open_in_memory().unwrap();
        open_one(&catalog, "cam-front", "/rec/a.mp4", 100);
        open_one(&catalog, "cam-front", "/rec/b.mp4", 200);
        open_one(&catalog, "cam-back", "/rec/c.mp4", 300);
        catalog.close_segment("/rec/a.mp4", 160, 10).unwrap();
        catalog.close_segment("/rec/b.mp4", 260, 20).unwrap();
        catalog.close_segment("/rec/c.mp4", 360, 30).unwrap();

        let all = catalog.list_segments(&SegmentQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].file_path, "/rec/a.mp4");

        let front = catalog
            .list_segments(&SegmentQuery {
                stream_name: Some("cam-front".into()),
                range_start: Some(150),
                range_end: Some(250),
                order: SegmentOrder::StartDesc,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(front.len(), 2);
        assert_eq!(front[0].file_path, "/rec/b.mp4");

        let count = catalog
            .count_segments(&SegmentQuery::stream("cam-front"))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_limit_offset() {
        let catalog = Catalog::open_in_memory().unwrap();
        for i in 0..5 {
            open_one(&catalog, "cam", &format!("/rec/{i}.mp4"), 100 * i);
        }
        let page = catalog
            .list_segments(&SegmentQuery {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].file_path, "/rec/2.mp4");
    }

    #[test]
    fn test_total_size() {
        let catalog = Catalog::open_in_memory().unwrap();
        open_one(&catalog, "cam-a", "/rec/a.mp4", 100);
        open_one(&catalog, "cam-b", "/rec/b.mp4", 200);
        catalog.close_segment("/rec/a.mp4", 150, 1000).unwrap();
        catalog.close_segment("/rec/b.mp4", 250, 500).unwrap();

        assert_eq!(catalog.total_size_bytes(Some("cam-a")).unwrap(), 1000);
        assert_eq!(catalog.total_size_bytes(None).unwrap(), 1500);
    }

    #[test]
    fn test_expired_and_oldest() {
        let catalog = Catalog::open_in_memory().unwrap();
        open_one(&catalog, "cam", "/rec/old.mp4", 100);
        open_one(&catalog, "cam", "/rec/new.mp4", 5000);
        catalog.close_segment("/rec/old.mp4", 160, 10).unwrap();
        catalog.close_segment("/rec/new.mp4", 5060, 10).unwrap();

        let expired = catalog.expired_segments("cam", 1000).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].file_path, "/rec/old.mp4");

        let oldest = catalog.oldest_complete_segments("cam", 1).unwrap();
        assert_eq!(oldest[0].file_path, "/rec/old.mp4");
    }

    #[test]
    fn test_delete_row_only() {
        let catalog = Catalog::open_in_memory().unwrap();
        let id = open_one(&catalog, "cam", "/rec/a.mp4", 100);
        catalog.delete_segment(id).unwrap();
        assert!(catalog.get_segment(id).unwrap().is_none());
        assert!(matches!(
            catalog.delete_segment(id),
            Err(CatalogError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_incomplete_segments() {
        let catalog = Catalog::open_in_memory().unwrap();
        open_one(&catalog, "cam", "/rec/a.mp4", 100);
        open_one(&catalog, "cam", "/rec/b.mp4", 200);
        catalog.close_segment("/rec/a.mp4", 160, 10).unwrap();

        let incomplete = catalog.incomplete_segments().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].file_path, "/rec/b.mp4");
    }
}
