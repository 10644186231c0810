use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("presentation timestamp went backwards: {prev} then {next}")]
    NonMonotonicPts { prev: i64, next: i64 },

    #[error("audio sample on a writer without an audio track")]
    NoAudioTrack,
}

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an ISO BMFF file: {0}")]
    NotAnMp4(String),

    #[error("no complete fragment survives in the file")]
    NoPlayableData,
}
