use thiserror::Error;

/// Custom error type for the batch toolkit.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: i64, end: i64 },

    // The three transient append errors are dedicated variants so append
    // call sites can match on them and drop the offending sample.
    #[error("out of order sample")]
    OutOfOrderSample,

    #[error("out of bounds")]
    OutOfBounds,

    #[error("duplicate sample for timestamp")]
    DuplicateSampleForTimestamp,

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Remote query failed: {0}")]
    Remote(String),

    #[error("Expression Error: {0}")]
    Expression(String),

    #[error("Parse Error: {0}")]
    Parse(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Corruption detected: {details}")]
    Corruption { details: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// True for append failures that are dropped per sample rather than
    /// cancelling the pipeline.
    pub fn is_transient_append(&self) -> bool {
        matches!(
            self,
            ForgeError::OutOfOrderSample
                | ForgeError::OutOfBounds
                | ForgeError::DuplicateSampleForTimestamp
        )
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::Lock(format!("Mutex/RwLock poisoned: {}", err))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ForgeError>;
