use thiserror::Error;

use crate::source::SourceError;

/// Broad classification used by outer surfaces (an HTTP layer maps these to
/// status codes; the engine itself decides retry behavior from them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    TransientIo,
    FatalIo,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("shutting down")]
    Cancelled,

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("catalog error: {0}")]
    Catalog(#[from] catalog_store::CatalogError),

    #[error("segment store error: {0}")]
    Store(#[from] segment_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Source(e) if e.is_transient() => ErrorKind::TransientIo,
            EngineError::Source(_) => ErrorKind::FatalIo,
            EngineError::Catalog(e) if e.is_conflict() => ErrorKind::Conflict,
            EngineError::Catalog(catalog_store::CatalogError::StreamNotFound(_))
            | EngineError::Catalog(catalog_store::CatalogError::SegmentNotFound(_)) => {
                ErrorKind::NotFound
            }
            EngineError::Catalog(_) => ErrorKind::FatalIo,
            EngineError::Store(_) => ErrorKind::FatalIo,
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            EngineError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EngineError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(EngineError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);

        let catalog_nf =
            EngineError::Catalog(catalog_store::CatalogError::StreamNotFound("c".into()));
        assert_eq!(catalog_nf.kind(), ErrorKind::NotFound);

        let io = EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        ));
        assert_eq!(io.kind(), ErrorKind::TransientIo);
    }
}
