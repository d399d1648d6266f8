use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use keel_core::error::AppError;
use keel_core::job::{JobStatus, ResultsLookup};

use crate::auth::require_api_key;
use crate::dto::{
    CreateJobRequest, CreateJobResponse, ErrorResponse, HealthResponse, JobResponse,
    MetricsResponse, ResultsPendingResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Submissions carry keyword lists, not documents.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/results", get(get_results))
        .route("/v1/metrics", get(metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job accepted", body = CreateJobResponse),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.jobs.submit(body).await?;
    let response = CreateJobResponse {
        job_id,
        status: JobStatus::Processing.to_string(),
    };
    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = JobResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .jobs
        .status(id)
        .await?
        .ok_or_else(|| AppError::JobNotFound(id.to_string()))?;
    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/results",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job results", body = serde_json::Value),
        (status = 202, description = "Job still processing", body = ResultsPendingResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 500, description = "Job failed", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let response = match state.jobs.results(id).await? {
        ResultsLookup::Ready(results) => (StatusCode::OK, axum::Json(results)).into_response(),
        ResultsLookup::Processing { progress, message } => {
            let body = ResultsPendingResponse {
                job_id: id,
                status: JobStatus::Processing.to_string(),
                progress,
                message,
            };
            (StatusCode::ACCEPTED, axum::Json(body)).into_response()
        }
        ResultsLookup::Failed { error } => {
            let body = ErrorResponse {
                error: "job_failed".to_string(),
                message: error,
            };
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
        }
        ResultsLookup::NotFound => return Err(AppError::JobNotFound(id.to_string()).into()),
    };
    Ok(response)
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/metrics",
    responses(
        (status = 200, description = "Request monitor and admission window snapshot", body = MetricsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(MetricsResponse {
        requests: state.monitor.snapshot(),
        rate_limiter: state.limiter.stats(),
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health() -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}
