use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_core::job::Job;
use keel_core::monitor::MonitorSnapshot;
use keel_core::rate_limit::RateLimiterStats;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Listing analysis parameters. The body is passed to the pipeline as-is
/// and validated there; this type documents its shape.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateJobRequest {
    /// Marketplace product id (ASIN).
    pub product_id: String,
    /// Marketplace host; defaults to the configured one.
    pub marketplace: Option<String>,
    pub keywords: Vec<KeywordRowRequest>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct KeywordRowRequest {
    pub keyword: String,
    pub search_volume: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub status: String,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub has_results: bool,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status.to_string(),
            progress: job.progress,
            message: job.message,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            error: job.error,
            has_results: job.results.is_some(),
        }
    }
}

/// Returned with `202` while a job is still running.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ResultsPendingResponse {
    pub job_id: Uuid,
    pub status: String,
    pub progress: u8,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MetricsResponse {
    /// Per-agent request counters and rates.
    #[schema(value_type = Object)]
    pub requests: MonitorSnapshot,
    /// Admission window occupancy.
    #[schema(value_type = Object)]
    pub rate_limiter: RateLimiterStats,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
