use thiserror::Error;

/// The payload does not have the envelope shape the extractor understands.
/// Fatal for the whole pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("empty payload")]
    Empty,
    #[error("no `data` array found in payload")]
    MissingArray,
    #[error("unexpected byte {byte:?} at offset {offset}")]
    UnexpectedByte { byte: char, offset: usize },
    #[error("element starting at offset {offset} is never closed")]
    UnterminatedElement { offset: usize },
    #[error("array starting at offset {offset} is never closed")]
    UnterminatedArray { offset: usize },
    #[error("string starting at offset {offset} is never closed")]
    UnterminatedString { offset: usize },
    #[error("offset {offset} is not an element boundary")]
    BadResumeOffset { offset: usize },
}

/// One element could not be mapped. Counted and skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("element is not a valid projection: {0}")]
    Decode(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("line value {0:?} is not numeric")]
    InvalidLine(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("store is corrupt: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Terminal failure of an ingestion pass or a rebuild.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("structural error: {0}")]
    Structural(#[from] StructuralError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("store is held by another writer")]
    StoreBusy,
    #[error("worker failed: {0}")]
    Worker(String),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
