use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single conversion job. Never aborts the batch.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("output {} is already claimed by another job", .0.display())]
    Conflict(PathBuf),
    #[error("cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Short reason recorded in the job outcome.
    pub fn reason(&self) -> String {
        match self {
            JobError::Conflict(_) => "conflict".to_string(),
            other => other.to_string(),
        }
    }
}

/// Conditions that stop a batch before any job is scheduled.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("source directory {} is not readable: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("destination directory {} is not writable: {source}", path.display())]
    DestinationNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("converter unavailable: {0}")]
    ConverterUnavailable(String),
}
