use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatamanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The file exists but its metadata could not be understood.
    #[error("Malformed dataset: {0}")]
    Malformed(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A precondition was violated by the caller (negative watermark,
    /// unbalanced lock release). Never retried.
    #[error("Contract violation: {0}")]
    Contract(String),

    /// The executor's own machinery failed; operator attention required.
    #[error("Executor fault: {0}")]
    Executor(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DatamanError {
    /// Malformed input is recoverable at the cache layer; everything else is
    /// reported to the caller as-is.
    pub fn is_malformed(&self) -> bool {
        matches!(self, DatamanError::Malformed(_))
    }
}

pub type Result<T> = std::result::Result<T, DatamanError>;
