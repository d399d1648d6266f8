use std::time::Duration;

use keel_core::error::AppError;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Process-level settings for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api_key: String,
    pub port: u16,
    pub inference_api_key: String,
    pub model: String,
    pub base_url: String,
    /// How long shutdown waits for running jobs.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Read configuration from environment variables.
    ///
    /// - `KEEL_SERVER_API_KEY` (required)
    /// - `KEEL_INFERENCE_API_KEY` (required)
    /// - `KEEL_SERVER_PORT` (optional, defaults to 3000)
    /// - `KEEL_MODEL` (optional, defaults to `gpt-4o-mini`)
    /// - `KEEL_BASE_URL` (optional, defaults to the OpenAI API)
    /// - `KEEL_SHUTDOWN_GRACE_SECS` (optional, defaults to 30)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |name: &str| {
            get(name).ok_or_else(|| AppError::ConfigError(format!("{name} must be set")))
        };

        let port = match get("KEEL_SERVER_PORT") {
            None => DEFAULT_PORT,
            Some(raw) => raw.parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid KEEL_SERVER_PORT '{raw}'"))
            })?,
        };

        let shutdown_grace = match get("KEEL_SHUTDOWN_GRACE_SECS") {
            None => DEFAULT_SHUTDOWN_GRACE,
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                AppError::ConfigError(format!(
                    "Invalid KEEL_SHUTDOWN_GRACE_SECS '{raw}': must be a non-negative integer"
                ))
            })?),
        };

        Ok(Self {
            api_key: require("KEEL_SERVER_API_KEY")?,
            port,
            inference_api_key: require("KEEL_INFERENCE_API_KEY")?,
            model: get("KEEL_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: get("KEEL_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            shutdown_grace,
        })
    }
}
