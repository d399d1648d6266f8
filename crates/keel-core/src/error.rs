use thiserror::Error;

/// Application-wide error types for Keel.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Inference API call failed.
    #[error("Inference error (HTTP {status_code}): {message}")]
    InferenceError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// HTML-to-Markdown conversion failed.
    #[error("Cleaner error: {0}")]
    CleanerError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The target site kept answering with blocking signals.
    #[error("Blocked by {url} after {attempts} attempts: {reason}")]
    Blocked {
        url: String,
        reason: String,
        attempts: u32,
    },

    /// A retryable operation ran out of attempts.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Every batch of a batched workload failed permanently.
    #[error("All {batches} batches failed: {summary}")]
    AllBatchesFailed { batches: usize, summary: String },

    /// Malformed or missing submission parameters.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No job with this id exists.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A job record refused a status change, e.g. reopening a finished job.
    #[error("Invalid job transition: {0}")]
    InvalidTransition(String),

    /// Key-value store operation failed.
    #[error("Store error: {0}")]
    StoreError(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::InferenceError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if the remote side is asking us to slow down.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded
                | AppError::InferenceError {
                    status_code: 429,
                    ..
                }
        )
    }
}
