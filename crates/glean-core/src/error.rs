//! Error types for Glean

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing tenant: no tenant id was resolved for this operation")]
    MissingTenant,

    #[error("Unparseable format: {0}")]
    UnparseableFormat(String),

    #[error("Row rejected: {0}")]
    RowRejected(String),

    #[error("Pattern store unavailable: {0}")]
    PatternStoreUnavailable(String),

    #[error("Transaction store unavailable: {0}")]
    TransactionStoreUnavailable(String),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM returned an invalid response: {0}")]
    LlmInvalidResponse(String),

    #[error("User edit protected: {0}")]
    UserEditRejected(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Job error: {0}")]
    Job(String),
}

impl Error {
    /// Whether this error is fatal for an in-flight ingest job.
    ///
    /// Row-level problems are recovered inside the job; store outages and
    /// tenant resolution failures abort it.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingTenant
                | Error::PatternStoreUnavailable(_)
                | Error::TransactionStoreUnavailable(_)
                | Error::Database(_)
                | Error::Pool(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
