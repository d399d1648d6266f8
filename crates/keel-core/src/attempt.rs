//! Tagged attempt outcomes and the retry loop that consumes them.
//!
//! Call sites never decide on their own whether to retry. They turn each
//! attempt into an [`Attempt`] and hand control to [`run_with_retry`], which
//! applies admission control, the retry ceiling and backoff uniformly.

use std::future::Future;

use crate::error::AppError;
use crate::monitor::RequestMonitor;
use crate::rate_limit::RateLimiter;

/// Outcome of one attempt at an operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    /// Worth another try after backoff.
    Retryable(AppError),
    /// Retrying cannot help.
    Fatal(AppError),
}

impl<T> Attempt<T> {
    /// Classify a result using [`AppError::is_retryable`].
    pub fn from_result(result: Result<T, AppError>) -> Self {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(e) if e.is_retryable() => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Attempt::Success(_))
    }
}

impl<T> From<Result<T, AppError>> for Attempt<T> {
    fn from(result: Result<T, AppError>) -> Self {
        Self::from_result(result)
    }
}

/// Run `op` until it succeeds, fails fatally, or runs out of retries.
///
/// Every attempt first waits for admission. `op` receives the 0-based
/// attempt number. Rate-limit errors additionally pause the shared limiter.
/// Retry bookkeeping for `request_id` is cleared on every exit path.
pub async fn run_with_retry<T, F, Fut>(
    limiter: &RateLimiter,
    monitor: &RequestMonitor,
    agent: &str,
    request_id: &str,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    monitor.record_start(agent, request_id);
    let mut attempt = 0u32;

    loop {
        limiter.await_admission().await;

        match op(attempt).await {
            Attempt::Success(value) => {
                limiter.reset(request_id);
                monitor.record_success(agent, request_id);
                return Ok(value);
            }
            Attempt::Fatal(e) => {
                limiter.reset(request_id);
                monitor.record_error(agent, request_id, &e.to_string());
                return Err(e);
            }
            Attempt::Retryable(e) => {
                if matches!(e, AppError::Timeout(_)) {
                    monitor.record_timeout(agent, request_id);
                }
                if e.is_rate_limit() {
                    limiter.slow_down(None);
                }

                if !limiter.should_retry(request_id) {
                    limiter.reset(request_id);
                    let exhausted = AppError::RetriesExhausted {
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    };
                    tracing::warn!(%agent, %request_id, attempts = attempt + 1, error = %e, "Retries exhausted");
                    monitor.record_error(agent, request_id, &exhausted.to_string());
                    return Err(exhausted);
                }

                limiter.register_retry(request_id);
                attempt += 1;
                tracing::warn!(%agent, %request_id, attempt, error = %e, "Attempt failed, retrying");
                monitor.record_retry(agent, request_id, &e.to_string());
                limiter.await_backoff(request_id, attempt).await;
            }
        }
    }
}
