use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use uuid::Uuid;

use keel_core::error::AppError;
use keel_core::testutil::{MockFetcher, html_page};

use crate::integration::common::{
    answering_inference, authed, body_json, drain, listing_body, send, setup_test_app,
    setup_test_app_with,
};

async fn submit(app: &crate::integration::common::TestApp, body: serde_json::Value) -> Uuid {
    let response = send(app, authed("POST", "/v1/jobs", Some(body))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["status"], "processing");
    json["job_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn health_returns_200_without_auth() {
    let app = setup_test_app();

    let response = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app();

    let response = send(
        &app,
        Request::get(format!("/v1/jobs/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app();

    let response = send(
        &app,
        Request::get("/v1/metrics")
            .header("authorization", "Bearer wrong-key")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submitted_job_completes_and_serves_results() {
    let app = setup_test_app();
    let id = submit(&app, listing_body(12)).await;

    drain(&app).await;

    let response = send(&app, authed("GET", &format!("/v1/jobs/{id}"), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = body_json(response).await;
    assert_eq!(job["status"], "complete");
    assert_eq!(job["progress"], 100);
    assert_eq!(job["has_results"], true);
    assert!(job["completed_at"].is_string());

    let response = send(&app, authed("GET", &format!("/v1/jobs/{id}/results"), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let results = body_json(response).await;
    assert_eq!(results["product_id"], "B0TEST1234");
    assert_eq!(results["keywords_requested"], 12);
    assert_eq!(results["keywords_analyzed"], 12);
    assert_eq!(results["partial"], false);
    assert_eq!(results["keywords"].as_array().unwrap().len(), 12);
    // Input order survives the batched merge.
    assert_eq!(results["keywords"][0]["keyword"], "hiking backpack 0");
    assert_eq!(results["keywords"][11]["keyword"], "hiking backpack 11");
}

#[tokio::test]
async fn invalid_submission_returns_400_and_creates_no_job() {
    let app = setup_test_app();

    for body in [
        json!({"product_id": "B0TEST1234", "keywords": []}),
        json!({"product_id": "not an asin!", "keywords": [{"keyword": "tent"}]}),
        json!({"keywords": [{"keyword": "tent"}]}),
    ] {
        let response = send(&app, authed("POST", "/v1/jobs", Some(body.clone()))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        let json = body_json(response).await;
        assert_eq!(json["error"], "validation_error");
    }

    assert!(app.runner.registry().store().is_empty());
    assert_eq!(app.runner.in_flight(), 0);
}

#[tokio::test]
async fn results_while_processing_return_202() {
    let fetcher = MockFetcher::new(&html_page("Slow page")).with_delay(Duration::from_secs(30));
    let app = setup_test_app_with(fetcher, answering_inference());
    let id = submit(&app, listing_body(3)).await;

    let response = send(&app, authed("GET", &format!("/v1/jobs/{id}/results"), None)).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["job_id"], id.to_string());
    assert_eq!(json["status"], "processing");
    assert!(json["progress"].as_u64().unwrap() < 100);
}

#[tokio::test]
async fn failed_job_results_return_500_with_error() {
    let fetcher = MockFetcher::with_error(AppError::HttpError("TLS handshake rejected".into()));
    let app = setup_test_app_with(fetcher, answering_inference());
    let id = submit(&app, listing_body(3)).await;

    drain(&app).await;

    let response = send(&app, authed("GET", &format!("/v1/jobs/{id}/results"), None)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"], "job_failed");
    assert!(json["message"].as_str().unwrap().contains("TLS handshake rejected"));

    let job = body_json(send(&app, authed("GET", &format!("/v1/jobs/{id}"), None)).await).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["has_results"], false);
}

#[tokio::test]
async fn unknown_job_returns_404() {
    let app = setup_test_app();
    let id = Uuid::new_v4();

    let response = send(&app, authed("GET", &format!("/v1/jobs/{id}"), None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");

    let response = send(&app, authed("GET", &format!("/v1/jobs/{id}/results"), None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_job_id_returns_400() {
    let app = setup_test_app();

    let response = send(&app, authed("GET", "/v1/jobs/not-a-uuid", None)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn metrics_reflect_completed_work() {
    let app = setup_test_app();
    submit(&app, listing_body(4)).await;
    drain(&app).await;

    let response = send(&app, authed("GET", "/v1/metrics", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let agents = &json["requests"]["agents"];
    assert_eq!(agents["scraper"]["successes"], 1);
    assert_eq!(agents["keywords"]["successes"], 1);
    assert_eq!(json["requests"]["overall"]["in_flight"], 0);
    assert!(json["rate_limiter"]["in_last_minute"].is_number());
}

#[tokio::test]
async fn openapi_document_lists_job_routes() {
    let app = setup_test_app();

    let response = send(
        &app,
        Request::get("/api-docs/openapi.json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["paths"]["/v1/jobs"].is_object());
    assert!(json["paths"]["/v1/jobs/{id}/results"].is_object());
}
