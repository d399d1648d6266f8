use std::str::FromStr;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::error::AppError;
use crate::pipeline::ListingConfig;
use crate::rate_limit::RateLimitConfig;
use crate::scrape::ScrapeConfig;

/// Tuning for the execution engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub rate: RateLimitConfig,
    pub scrape: ScrapeConfig,
    pub listing: ListingConfig,
}

impl EngineConfig {
    /// Read configuration from environment variables. Every variable is
    /// optional and falls back to the built-in default.
    ///
    /// - `KEEL_RATE_PER_SECOND`, `KEEL_RATE_PER_MINUTE` (0 disables)
    /// - `KEEL_RETRY_BASE_MS`, `KEEL_RETRY_MAX_MS`, `KEEL_RETRY_JITTER_MS`,
    ///   `KEEL_MAX_RETRIES`
    /// - `KEEL_BATCH_SIZE`, `KEEL_BATCH_CONCURRENCY`, `KEEL_BATCH_TIMEOUT_SECS`
    /// - `KEEL_SCRAPE_MAX_ATTEMPTS`, `KEEL_SCRAPE_PACING_MIN_MS`,
    ///   `KEEL_SCRAPE_PACING_MAX_MS`, `KEEL_SCRAPE_MIN_BODY_BYTES`
    /// - `KEEL_MARKETPLACE`, `KEEL_MAX_CONTENT_CHARS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let env = Env(lookup);
        let defaults = EngineConfig::default();

        let rate = RateLimitConfig {
            requests_per_second: env.parse("KEEL_RATE_PER_SECOND", defaults.rate.requests_per_second)?,
            requests_per_minute: env.parse("KEEL_RATE_PER_MINUTE", defaults.rate.requests_per_minute)?,
            base_delay: env.millis("KEEL_RETRY_BASE_MS", defaults.rate.base_delay)?,
            max_delay: env.millis("KEEL_RETRY_MAX_MS", defaults.rate.max_delay)?,
            jitter: env.millis("KEEL_RETRY_JITTER_MS", defaults.rate.jitter)?,
            max_retries: env.parse("KEEL_MAX_RETRIES", defaults.rate.max_retries)?,
        };
        if rate.max_delay < rate.base_delay {
            return Err(AppError::ConfigError(
                "KEEL_RETRY_MAX_MS must not be below KEEL_RETRY_BASE_MS".into(),
            ));
        }

        let keyword_batch = BatchConfig {
            batch_size: env.positive("KEEL_BATCH_SIZE", defaults.listing.keyword_batch.batch_size)?,
            concurrency: env.positive(
                "KEEL_BATCH_CONCURRENCY",
                defaults.listing.keyword_batch.concurrency,
            )?,
            batch_timeout: Duration::from_secs(env.positive(
                "KEEL_BATCH_TIMEOUT_SECS",
                defaults.listing.keyword_batch.batch_timeout.as_secs(),
            )?),
        };

        let scrape = ScrapeConfig {
            max_attempts: env.positive("KEEL_SCRAPE_MAX_ATTEMPTS", defaults.scrape.max_attempts)?,
            pacing_min: env.millis("KEEL_SCRAPE_PACING_MIN_MS", defaults.scrape.pacing_min)?,
            pacing_max: env.millis("KEEL_SCRAPE_PACING_MAX_MS", defaults.scrape.pacing_max)?,
            min_body_bytes: env.parse("KEEL_SCRAPE_MIN_BODY_BYTES", defaults.scrape.min_body_bytes)?,
            ..defaults.scrape
        };
        if scrape.pacing_max < scrape.pacing_min {
            return Err(AppError::ConfigError(
                "KEEL_SCRAPE_PACING_MAX_MS must not be below KEEL_SCRAPE_PACING_MIN_MS".into(),
            ));
        }

        let listing = ListingConfig {
            default_marketplace: env
                .raw("KEEL_MARKETPLACE")
                .unwrap_or(defaults.listing.default_marketplace),
            max_content_chars: env.positive(
                "KEEL_MAX_CONTENT_CHARS",
                defaults.listing.max_content_chars,
            )?,
            keyword_batch,
            ..defaults.listing
        };

        Ok(Self {
            rate,
            scrape,
            listing,
        })
    }
}

struct Env<L>(L);

impl<L: Fn(&str) -> Option<String>> Env<L> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> Result<T, AppError> {
        match self.raw(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid {name} '{raw}': must be a non-negative integer"))
            }),
        }
    }

    fn positive<T: FromStr + PartialEq + Default>(&self, name: &str, default: T) -> Result<T, AppError> {
        let value = self.parse(name, default)?;
        if value == T::default() {
            return Err(AppError::ConfigError(format!("{name} must be at least 1")));
        }
        Ok(value)
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration, AppError> {
        Ok(Duration::from_millis(self.parse(name, default.as_millis() as u64)?))
    }
}
