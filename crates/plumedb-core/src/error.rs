use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlumeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("bucket {0} out of range")]
    BucketOutOfRange(u32),
    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, PlumeError>;
