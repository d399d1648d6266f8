use std::path::PathBuf;
use std::time::Duration;

use keel_core::error::AppError;
use keel_core::registry::DEFAULT_JOB_TTL;
use keel_core::store::FallbackStore;

use crate::file_store::FileStore;
use crate::redis_store::RedisStore;

/// Redis primary with a local-directory fallback.
pub type JobStore = FallbackStore<RedisStore, FileStore>;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_DATA_DIR: &str = "./data/jobs";

/// Configuration for job record persistence.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    pub data_dir: PathBuf,
    /// `None` keeps records until deleted.
    pub job_ttl: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            job_ttl: Some(DEFAULT_JOB_TTL),
        }
    }
}

impl StoreConfig {
    /// Read configuration from environment variables.
    ///
    /// - `REDIS_URL` (optional, defaults to `redis://127.0.0.1:6379`)
    /// - `KEEL_DATA_DIR` (optional, defaults to `./data/jobs`)
    /// - `KEEL_JOB_TTL_SECS` (optional, defaults to 86400; 0 disables expiry)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let job_ttl = match get("KEEL_JOB_TTL_SECS") {
            None => defaults.job_ttl,
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| {
                    AppError::ConfigError(format!(
                        "Invalid KEEL_JOB_TTL_SECS '{raw}': must be a non-negative integer"
                    ))
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        Ok(Self {
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            data_dir: get("KEEL_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            job_ttl,
        })
    }

    /// Build the fallback store. Redis is connected lazily; the data
    /// directory is created here.
    pub async fn open(&self) -> Result<JobStore, AppError> {
        let redis = RedisStore::new(&self.redis_url)?;
        let files = FileStore::open(&self.data_dir).await?;
        tracing::info!(data_dir = %self.data_dir.display(), "Job store ready");
        Ok(FallbackStore::new(redis, files))
    }
}
