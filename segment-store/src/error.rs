use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] catalog_store::CatalogError),

    #[error("muxer error: {0}")]
    Writer(#[from] mp4_writer::WriterError),

    #[error("repair error: {0}")]
    Repair(#[from] mp4_writer::RepairError),

    #[error("failed to get filesystem stats: {0}")]
    StatvfsFailed(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(String),
}
