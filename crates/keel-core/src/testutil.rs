//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests and in the
//! server's router tests (feature `testutil`). All mocks use
//! `Arc<Mutex<_>>` so tests can assert on recorded calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::traits::{Cleaner, FetchRequest, Fetcher, Inference, KvStore, RawResponse};
use crate::worker::{WorkerEvent, WorkerReporter};

/// A plausible product page, comfortably above any minimum body size.
pub fn html_page(title: &str) -> String {
    let filler = "<p>Durable, lightweight and ready for everyday use.</p>".repeat(40);
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head>\
         <body><h1 id=\"productTitle\">{title}</h1>{filler}</body></html>"
    )
}

/// A 200 `text/html` response with the given body.
pub fn html_response(body: &str) -> RawResponse {
    RawResponse {
        status: 200,
        content_type: Some("text/html; charset=utf-8".to_string()),
        body: body.to_string(),
    }
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Store whose every operation fails, standing in for an unreachable cache.
#[derive(Debug, Clone, Default)]
pub struct FailingStore;

impl FailingStore {
    pub fn new() -> Self {
        Self
    }
}

impl KvStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, AppError> {
        Err(AppError::StoreError("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), AppError> {
        Err(AppError::StoreError("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), AppError> {
        Err(AppError::StoreError("connection refused".into()))
    }
}

// ---------------------------------------------------------------------------
// SwitchableStore
// ---------------------------------------------------------------------------

/// Wraps a store and fails every operation while switched down.
#[derive(Debug, Clone)]
pub struct SwitchableStore<S> {
    inner: S,
    down: Arc<AtomicBool>,
}

impl<S: KvStore> SwitchableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.down.load(Ordering::SeqCst) {
            Err(AppError::StoreError("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl<S: KvStore> KvStore for SwitchableStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.check()?;
        self.inner.delete(key).await
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that replays a queue of responses and records requests.
#[derive(Clone)]
pub struct MockFetcher {
    /// Each call pops the first element. If empty, returns a default page.
    responses: Arc<Mutex<Vec<Result<RawResponse, AppError>>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
    delay: Duration,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_responses(vec![Ok(html_response(html))])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<RawResponse, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    /// Simulated network latency applied to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(html_response(&html_page("Default product")))
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockCleaner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockCleaner {
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockCleaner {
    /// Creates a cleaner that returns the input unchanged.
    pub fn passthrough() -> Self {
        Self {
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a cleaner whose first call fails.
    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(html.to_string())
    }
}

// ---------------------------------------------------------------------------
// MockInference
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn(&str) -> Result<String, AppError> + Send + Sync>;

/// Mock inference backend.
///
/// Answers from a queue first; once the queue is empty, from the responder
/// closure (or an empty JSON array when none is set).
#[derive(Clone)]
pub struct MockInference {
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    responder: Option<Responder>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockInference {
    pub fn new(response: &str) -> Self {
        Self::with_responses(vec![Ok(response.to_string())])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            responder: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Compute each answer from the prompt.
    pub fn with_responder(
        responder: impl Fn(&str) -> Result<String, AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            responder: Some(Arc::new(responder)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Inference for MockInference {
    async fn infer(&self, prompt: &str) -> Result<String, AppError> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        let queued = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };

        match (queued, &self.responder) {
            (Some(response), _) => response,
            (None, Some(responder)) => responder(prompt),
            (None, None) => Ok("[]".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records the name of every event it receives.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        self.events.lock().unwrap().push(event.name());
    }
}
