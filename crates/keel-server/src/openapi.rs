use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Keel API",
        version = "0.1.0",
        description = "Background listing analysis jobs with rate-limited inference and resilient scraping."
    ),
    paths(
        crate::routes::create_job,
        crate::routes::get_job,
        crate::routes::get_results,
        crate::routes::metrics,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::CreateJobRequest,
        crate::dto::KeywordRowRequest,
        crate::dto::CreateJobResponse,
        crate::dto::JobResponse,
        crate::dto::ResultsPendingResponse,
        crate::dto::MetricsResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "jobs", description = "Job submission and polling"),
        (name = "system", description = "Health and runtime metrics"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some("API key. Set via KEEL_SERVER_API_KEY."))
                        .build(),
                ),
            );
        }
    }
}
