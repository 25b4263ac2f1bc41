use thiserror::Error;

#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("Invalid segment size: {0}")]
    InvalidSegmentSize(u64),

    #[error("Unknown buffer id: {0}")]
    UnknownBuffer(u64),

    #[error("Double free of segment {offset} in buffer {buffer_id}")]
    DoubleFree { buffer_id: u64, offset: u64 },

    #[error("Corrupt validity bitmap: {0}")]
    CorruptBitmap(&'static str),

    #[error("Cannot serialize empty buffer {0}")]
    EmptyBuffer(u64),

    #[error("Segment size mismatch: {0} vs {1}")]
    SegmentSizeMismatch(u64, u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TesseraError>;
