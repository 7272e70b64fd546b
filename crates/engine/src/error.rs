use thiserror::Error;

/// The engine's error taxonomy. Segment-level transient failures (network,
/// timeout, HTTP status) are retried internally by the fetcher and only
/// surface here once that retry budget is exhausted.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("server did not report Content-Length")]
    SizeUnknown,

    #[error("no URLs were provided")]
    NoUrls,

    #[error("alwaysResume is set, the output file exists, but no control record was found")]
    ResumeRequired,

    #[error("alwaysResume is set and the control record's segment span ({found}) does not match the current size ({expected})")]
    ResumeMismatch { expected: u64, found: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("download was cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("all remaining segments are in the failed state")]
    AllSegmentsFailed,
}

impl From<paradl_storage::StorageError> for EngineError {
    fn from(e: paradl_storage::StorageError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout
        } else if let Some(status) = e.status() {
            EngineError::HttpStatus(status.as_u16())
        } else {
            EngineError::Network(e.to_string())
        }
    }
}
