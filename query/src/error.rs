use crate::dsl::QueryValidationError;
use crate::lifecycle::LifecycleError;
use pagecite_core::error::{ErrorCode, PageciteError};
use storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("all {0} sub-queries timed out")]
    AllRetrievalTimedOut(usize),
    #[error("query deadline of {0}ms exceeded")]
    DeadlineExceeded(u64),
    #[error("query cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<QueryValidationError> for QueryError {
    fn from(err: QueryValidationError) -> Self {
        QueryError::InvalidQuery(err.to_string())
    }
}

impl From<LifecycleError> for QueryError {
    fn from(err: LifecycleError) -> Self {
        QueryError::Internal(err.to_string())
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => QueryError::IndexUnavailable(reason),
            other => QueryError::Internal(other.to_string()),
        }
    }
}

impl PageciteError for QueryError {
    fn error_code(&self) -> ErrorCode {
        match self {
            QueryError::InvalidQuery(_) => ErrorCode::InvalidArgument,
            QueryError::IndexUnavailable(_) => ErrorCode::Unavailable,
            QueryError::AllRetrievalTimedOut(_) | QueryError::DeadlineExceeded(_) => {
                ErrorCode::DeadlineExceeded
            }
            QueryError::Cancelled => ErrorCode::Cancelled,
            QueryError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl QueryError {
    /// Short reason recorded in the `Failed` lifecycle state.
    pub fn reason(&self) -> &'static str {
        match self {
            QueryError::InvalidQuery(_) => "InvalidQuery",
            QueryError::IndexUnavailable(_) => "IndexUnavailable",
            QueryError::AllRetrievalTimedOut(_) => "AllRetrievalTimedOut",
            QueryError::DeadlineExceeded(_) => "DeadlineExceeded",
            QueryError::Cancelled => "Cancelled",
            QueryError::Internal(_) => "Internal",
        }
    }
}
