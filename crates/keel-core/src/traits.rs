use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// One outbound page request, already dressed with a client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub user_agent: String,
    pub accept_language: String,
    pub referer: Option<String>,
}

impl FetchRequest {
    /// A bare request with a generic identity, mostly useful in tests.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: "Mozilla/5.0".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            referer: None,
        }
    }
}

/// Raw HTTP response as seen by the scrape resilience layer.
///
/// Non-2xx statuses are returned here rather than as errors so the caller
/// can classify blocking signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Fetches a raw document from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<RawResponse, AppError>> + Send;
}

/// Converts raw HTML into clean Markdown text.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// Remote LLM inference: prompt in, text out.
///
/// Implementations should map overload responses to retryable errors
/// (`RateLimitExceeded`, retryable `InferenceError`, `Timeout`).
pub trait Inference: Send + Sync + Clone + 'static {
    fn infer(&self, prompt: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Minimal key-value contract used by the job registry.
pub trait KvStore: Send + Sync + Clone + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}
