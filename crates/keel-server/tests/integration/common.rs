use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use keel_core::batch::BatchConfig;
use keel_core::error::AppError;
use keel_core::pipeline::{ListingConfig, ListingPipeline};
use keel_core::rate_limit::RateLimitConfig;
use keel_core::scrape::{ResilientFetcher, ScrapeConfig};
use keel_core::store::MemoryStore;
use keel_core::testutil::{MockCleaner, MockFetcher, MockInference};
use keel_core::{JobRegistry, JobRunner, RateLimiter, RequestMonitor};
use keel_server::routes;
use keel_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

pub type TestRunner = JobRunner<MemoryStore, ListingPipeline<MockFetcher, MockCleaner, MockInference>>;

pub struct TestApp {
    pub router: Router,
    pub runner: TestRunner,
}

/// App whose collaborators answer immediately and successfully.
pub fn setup_test_app() -> TestApp {
    setup_test_app_with(MockFetcher::new(&keel_core::testutil::html_page("Trail Backpack 30L")), answering_inference())
}

/// App over an in-memory registry with the given page source and model.
pub fn setup_test_app_with(fetcher: MockFetcher, inference: MockInference) -> TestApp {
    let limiter = RateLimiter::new(RateLimitConfig {
        requests_per_second: 0,
        requests_per_minute: 0,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: Duration::ZERO,
        max_retries: 1,
    });
    let monitor = RequestMonitor::new();
    let scraper = ResilientFetcher::new(
        fetcher,
        ScrapeConfig {
            max_attempts: 1,
            pacing_min: Duration::ZERO,
            pacing_max: Duration::ZERO,
            min_body_bytes: 256,
            ..ScrapeConfig::default()
        },
        monitor.clone(),
    );
    let pipeline = ListingPipeline::new(
        scraper,
        MockCleaner::passthrough(),
        inference,
        limiter.clone(),
        monitor.clone(),
        ListingConfig {
            keyword_batch: BatchConfig {
                batch_size: 10,
                concurrency: 2,
                batch_timeout: Duration::from_secs(5),
            },
            ..ListingConfig::default()
        },
    );
    let runner = JobRunner::new(JobRegistry::new(MemoryStore::new()), pipeline);

    let state = Arc::new(AppState {
        jobs: Arc::new(runner.clone()),
        monitor,
        limiter,
        api_key: TEST_API_KEY.to_string(),
    });

    TestApp {
        router: routes::router(state),
        runner,
    }
}

/// Model stub: one object per keyword, plain text for copy prompts.
pub fn answering_inference() -> MockInference {
    MockInference::with_responder(|prompt: &str| -> Result<String, AppError> {
        if prompt.starts_with("Write") {
            return Ok("Trail Backpack 30L, water resistant".to_string());
        }
        let count = prompt
            .split("exactly ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        let entries: Vec<_> = (0..count).map(|_| json!({"relevance": 8})).collect();
        Ok(serde_json::to_string(&entries)?)
    })
}

pub fn listing_body(keywords: usize) -> serde_json::Value {
    json!({
        "product_id": "B0TEST1234",
        "keywords": (0..keywords)
            .map(|i| json!({"keyword": format!("hiking backpack {i}"), "search_volume": 1200 + i}))
            .collect::<Vec<_>>(),
    })
}

pub fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn send(app: &TestApp, request: Request<Body>) -> Response<Body> {
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// Wait until the runner has no jobs left.
pub async fn drain(app: &TestApp) {
    for _ in 0..200 {
        if app.runner.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("jobs did not finish in time");
}
