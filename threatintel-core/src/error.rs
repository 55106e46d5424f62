use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FeedJobError {
    /// Another holder owns the job lease.
    #[error("Job is locked by another operation: {0}")]
    Contention(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Feed header is missing previously recorded fields: {}", missing.join(", "))]
    IncompatibleFields { missing: Vec<String> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Feed fetch failed: {0}")]
    Fetch(String),

    #[error("Feed parse failed: {0}")]
    Parse(String),

    #[error("Shards of index {index} did not start within {waited_ms}ms")]
    ShardTimeout { index: String, waited_ms: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for FeedJobError {
    fn from(err: reqwest::Error) -> Self {
        FeedJobError::Fetch(err.to_string())
    }
}

impl From<csv::Error> for FeedJobError {
    fn from(err: csv::Error) -> Self {
        FeedJobError::Parse(err.to_string())
    }
}

impl FeedJobError {
    /// Errors raised before any mutation took place; surfaced to the caller as-is.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FeedJobError::Validation(_)
                | FeedJobError::IncompatibleFields { .. }
                | FeedJobError::NotFound(_)
                | FeedJobError::AlreadyExists(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FeedJobError>;
