use thiserror::Error;

/// Custom error type for datastore operations.
#[derive(Error, Debug)]
pub enum TinyFluxError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("Batch size must be at least 1, got {0}")]
    InvalidBatchSize(usize),

    #[error("Unknown select path: {0:?}")]
    UnknownSelectPath(String),

    #[error("Update must set at least one of time, measurement, tags, or fields")]
    EmptyUpdate,

    #[error("Malformed storage row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
}
