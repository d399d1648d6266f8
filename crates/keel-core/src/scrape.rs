//! Blocking-aware page fetching.
//!
//! Wraps any [`Fetcher`] with identity rotation, randomized per-domain
//! pacing, and classification of responses that look like the target site
//! resisting automated access. Fetches to the same domain are serialized:
//! a per-domain async mutex is held for the whole fetch, retries included.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_core::monitor::RequestMonitor;
//! use keel_core::scrape::{ResilientFetcher, ScrapeConfig};
//! # use keel_core::traits::{FetchRequest, Fetcher, RawResponse};
//! # #[derive(Clone)] struct MyFetcher;
//! # impl Fetcher for MyFetcher {
//! #     async fn fetch(&self, _: &FetchRequest) -> Result<RawResponse, keel_core::AppError> { todo!() }
//! # }
//!
//! # async fn run() -> Result<(), keel_core::AppError> {
//! let fetcher = ResilientFetcher::new(MyFetcher, ScrapeConfig::default(), RequestMonitor::new());
//! let page = fetcher.fetch("https://www.amazon.com/dp/B0TEST1234").await?;
//! println!("{} bytes after {} attempts", page.body.len(), page.attempts.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::identity::{ClientIdentity, IdentityPool, referer_for};
use crate::monitor::RequestMonitor;
use crate::traits::{FetchRequest, Fetcher, RawResponse};

/// Monitor agent name for page fetches.
pub const SCRAPER_AGENT: &str = "scraper";

/// Upper bound on consecutive slow responses that widen pacing.
const MAX_SLOW_STEPS: u32 = 3;

/// Domain slots unused for this long are dropped on the next lookup.
const DOMAIN_IDLE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Attempts per fetch, first one included.
    pub max_attempts: u32,

    /// Randomized pause before each attempt is drawn from
    /// `[pacing_min, pacing_max]`.
    pub pacing_min: Duration,
    pub pacing_max: Duration,

    /// Responses slower than this widen the pacing window for the domain.
    pub slow_threshold: Duration,

    /// Statuses treated as blocking signals rather than hard failures.
    pub blocking_statuses: Vec<u16>,

    /// Required content-type prefix.
    pub expected_content_type: String,

    /// Bodies shorter than this are treated as interstitials.
    pub min_body_bytes: usize,

    /// Case-insensitive substrings that mark a verification page.
    pub blocking_markers: Vec<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pacing_min: Duration::from_millis(1000),
            pacing_max: Duration::from_millis(3000),
            slow_threshold: Duration::from_secs(5),
            blocking_statuses: vec![403, 429, 500, 502, 503, 504],
            expected_content_type: "text/html".to_string(),
            min_body_bytes: 1024,
            blocking_markers: vec![
                "captcha".to_string(),
                "robot check".to_string(),
                "enter the characters you see below".to_string(),
                "make sure you're not a robot".to_string(),
                "automated access".to_string(),
            ],
        }
    }
}

/// Why a response was classified as blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    Status { status: u16 },
    ContentType { content_type: Option<String> },
    BodyTooSmall { len: usize, min: usize },
    Marker { marker: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Status { status } => write!(f, "blocking status {status}"),
            BlockReason::ContentType { content_type } => write!(
                f,
                "unexpected content-type {}",
                content_type.as_deref().unwrap_or("<none>")
            ),
            BlockReason::BodyTooSmall { len, min } => {
                write!(f, "body too small ({len} bytes, expected at least {min})")
            }
            BlockReason::Marker { marker } => write!(f, "verification marker '{marker}'"),
        }
    }
}

/// How a single response was judged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Blocked(BlockReason),
    /// Non-2xx status outside the blocking set: a hard failure.
    Rejected(u16),
}

/// Judge a response against the blocking rules.
pub fn classify(response: &RawResponse, config: &ScrapeConfig) -> Verdict {
    if config.blocking_statuses.contains(&response.status) {
        return Verdict::Blocked(BlockReason::Status {
            status: response.status,
        });
    }
    if !(200..300).contains(&response.status) {
        return Verdict::Rejected(response.status);
    }

    let expected = config.expected_content_type.to_ascii_lowercase();
    let content_type_ok = response
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with(&expected));
    if !content_type_ok {
        return Verdict::Blocked(BlockReason::ContentType {
            content_type: response.content_type.clone(),
        });
    }

    if response.body.len() < config.min_body_bytes {
        return Verdict::Blocked(BlockReason::BodyTooSmall {
            len: response.body.len(),
            min: config.min_body_bytes,
        });
    }

    let body = response.body.to_lowercase();
    if let Some(marker) = config
        .blocking_markers
        .iter()
        .find(|m| body.contains(&m.to_lowercase()))
    {
        return Verdict::Blocked(BlockReason::Marker {
            marker: marker.clone(),
        });
    }

    Verdict::Accepted
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Blocked { reason: BlockReason },
    TransientError { error: String },
}

/// One outbound attempt, kept for the caller's diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeAttempt {
    pub target_url: String,
    pub identity: ClientIdentity,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
}

/// An accepted page plus the attempts it took.
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub attempts: Vec<ScrapeAttempt>,
}

#[derive(Debug, Default)]
struct DomainState {
    last_request: Option<Instant>,
    slow_streak: u32,
}

impl DomainState {
    fn observe_latency(&mut self, latency: Duration, threshold: Duration) {
        if latency > threshold {
            self.slow_streak = (self.slow_streak + 1).min(MAX_SLOW_STEPS);
        } else {
            self.slow_streak = 0;
        }
    }
}

/// Last failure seen while retrying, used to build the final error.
enum Failure {
    Blocked(BlockReason),
    Transient(AppError),
}

/// A fetcher that survives blocking signals.
#[derive(Clone)]
pub struct ResilientFetcher<F> {
    inner: F,
    config: Arc<ScrapeConfig>,
    identities: Arc<IdentityPool>,
    monitor: RequestMonitor,
    /// One slot per domain key; the slot's lock is held for a whole fetch.
    /// Marketplace hosts come from requests, so idle slots are pruned.
    domains: Arc<Mutex<HashMap<String, Arc<Mutex<DomainState>>>>>,
}

impl<F: Fetcher> ResilientFetcher<F> {
    pub fn new(inner: F, config: ScrapeConfig, monitor: RequestMonitor) -> Self {
        Self {
            inner,
            config: Arc::new(config),
            identities: Arc::new(IdentityPool::browsers()),
            monitor,
            domains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_identities(mut self, identities: IdentityPool) -> Self {
        self.identities = Arc::new(identities);
        self
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    /// Fetch `url`, rotating identity and retrying on blocking signals and
    /// transient errors.
    pub async fn fetch(&self, url: &str) -> Result<ScrapedPage, AppError> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::InvalidInput(format!("invalid URL '{url}': {e}")))?;
        let domain = domain_key(&parsed)
            .ok_or_else(|| AppError::InvalidInput(format!("URL has no host: {url}")))?;

        let slot = self.domain_slot(&domain).await;
        let mut state = slot.lock().await;

        let request_id = format!("{url}#{}", Uuid::new_v4().simple());
        self.monitor.record_start(SCRAPER_AGENT, &request_id);

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut previous: Option<ClientIdentity> = None;
        let mut last_failure = None;

        for attempt_number in 1..=max_attempts {
            let identity = self.identities.next_different(previous.as_ref()).clone();
            let request = FetchRequest {
                url: url.to_string(),
                user_agent: identity.user_agent.clone(),
                accept_language: identity.accept_language.clone(),
                referer: referer_for(&parsed),
            };

            self.pace(&domain, &state).await;

            let started = Instant::now();
            let result = self.inner.fetch(&request).await;
            state.last_request = Some(Instant::now());
            state.observe_latency(started.elapsed(), self.config.slow_threshold);

            let outcome = match result {
                Ok(response) => match classify(&response, &self.config) {
                    Verdict::Accepted => {
                        attempts.push(ScrapeAttempt {
                            target_url: url.to_string(),
                            identity,
                            attempt_number,
                            outcome: AttemptOutcome::Success,
                        });
                        self.monitor.record_success(SCRAPER_AGENT, &request_id);
                        tracing::debug!(%url, attempts = attempt_number, "Page fetched");
                        return Ok(ScrapedPage {
                            url: url.to_string(),
                            status: response.status,
                            body: response.body,
                            attempts,
                        });
                    }
                    Verdict::Blocked(reason) => {
                        tracing::warn!(%url, attempt = attempt_number, %reason, "Response looks blocked");
                        last_failure = Some(Failure::Blocked(reason.clone()));
                        AttemptOutcome::Blocked { reason }
                    }
                    Verdict::Rejected(status) => {
                        let e = AppError::HttpError(format!("{url} returned HTTP {status}"));
                        self.monitor.record_error(SCRAPER_AGENT, &request_id, &e.to_string());
                        return Err(e);
                    }
                },
                Err(e) if e.is_retryable() => {
                    tracing::warn!(%url, attempt = attempt_number, error = %e, "Transient fetch error");
                    let outcome = AttemptOutcome::TransientError {
                        error: e.to_string(),
                    };
                    if matches!(e, AppError::Timeout(_)) {
                        self.monitor.record_timeout(SCRAPER_AGENT, &request_id);
                    }
                    last_failure = Some(Failure::Transient(e));
                    outcome
                }
                Err(e) => {
                    self.monitor.record_error(SCRAPER_AGENT, &request_id, &e.to_string());
                    return Err(e);
                }
            };

            attempts.push(ScrapeAttempt {
                target_url: url.to_string(),
                identity: identity.clone(),
                attempt_number,
                outcome,
            });

            if attempt_number < max_attempts {
                self.monitor
                    .record_retry(SCRAPER_AGENT, &request_id, "blocked or transient");
            }
            previous = Some(identity);
        }

        let error = match last_failure {
            Some(Failure::Transient(e)) => e,
            Some(Failure::Blocked(reason)) => AppError::Blocked {
                url: url.to_string(),
                reason: reason.to_string(),
                attempts: max_attempts,
            },
            None => AppError::Generic(format!("no attempts made for {url}")),
        };
        self.monitor
            .record_error(SCRAPER_AGENT, &request_id, &error.to_string());
        Err(error)
    }

    /// Domains with pacing state currently kept.
    pub async fn tracked_domains(&self) -> usize {
        self.domains.lock().await.len()
    }

    async fn domain_slot(&self, domain: &str) -> Arc<Mutex<DomainState>> {
        // Longer than any pacing delay, so a dropped slot had nothing left to enforce.
        let idle_after = DOMAIN_IDLE.max(self.config.pacing_max.saturating_mul(3));

        let mut domains = self.domains.lock().await;
        domains.retain(|key, slot| {
            if key == domain || Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(state) => state
                    .last_request
                    .is_some_and(|last| last.elapsed() < idle_after),
                Err(_) => true,
            }
        });
        domains.entry(domain.to_string()).or_default().clone()
    }

    /// Sleep out whatever is left of this attempt's pacing delay.
    async fn pace(&self, domain: &str, state: &DomainState) {
        let delay = self.pacing_delay(state.slow_streak);
        let wait = match state.last_request {
            Some(last) => delay.saturating_sub(last.elapsed()),
            None => delay,
        };
        if !wait.is_zero() {
            tracing::debug!(%domain, sleep_ms = %wait.as_millis(), slow_streak = state.slow_streak, "Pacing request");
            tokio::time::sleep(wait).await;
        }
    }

    fn pacing_delay(&self, slow_streak: u32) -> Duration {
        let min = self.config.pacing_min.as_millis() as u64;
        let max = (self.config.pacing_max.as_millis() as u64).max(min);
        let base = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        let widening = (max / 2).saturating_mul(u64::from(slow_streak.min(MAX_SLOW_STEPS)));
        Duration::from_millis(base.saturating_add(widening))
    }
}

/// Extract the domain key from a URL (scheme://host:port).
fn domain_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Some(format!("{}://{}{}", url.scheme(), host, port))
}
