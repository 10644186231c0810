use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    #[error("invalid stream name: {0}")]
    InvalidName(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("catalog schema is version {found}, newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

impl CatalogError {
    /// Whether this error is a uniqueness/state conflict rather than a hard failure.
    pub fn is_conflict(&self) -> bool {
        match self {
            CatalogError::Conflict(_) => true,
            CatalogError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}
