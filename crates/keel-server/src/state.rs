use std::sync::Arc;

use keel_core::{JobApi, RateLimiter, RequestMonitor};

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub jobs: Arc<dyn JobApi>,
    pub monitor: RequestMonitor,
    pub limiter: RateLimiter,
    /// Bearer token required on `/v1` routes.
    pub api_key: String,
}
