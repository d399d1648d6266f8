//! Admission control against the inference service's request quotas.
//!
//! The service enforces both a per-second and a per-minute budget. A single
//! [`RateLimiter`] instance is shared by every caller in a pipeline so the
//! *aggregate* call rate stays inside both budgets:
//!
//! ```text
//!  batch 0 ─┐
//!  batch 1 ─┼─> await_admission() ──[1s window][60s window][cooldown]──> infer()
//!  batch N ─┘        (FIFO turn lock)
//! ```
//!
//! The limiter also owns retry bookkeeping (`should_retry`,
//! `register_retry`, `reset`) and the exponential backoff schedule. It never
//! fails; it only delays.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Quotas and retry schedule for the admission controller.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum admissions in any rolling 1-second window. `0` disables the check.
    pub requests_per_second: u32,

    /// Maximum admissions in any rolling 60-second window. `0` disables the check.
    pub requests_per_minute: u32,

    /// Backoff base: attempt `n` waits roughly `base * 2^n`.
    pub base_delay: Duration,

    /// Upper bound for a single backoff wait.
    pub max_delay: Duration,

    /// Uniform jitter band applied to backoff waits (`±jitter`).
    pub jitter: Duration,

    /// Retries allowed per request id before `should_retry` turns false.
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            requests_per_minute: 50,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    second: VecDeque<Instant>,
    minute: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while self
            .second
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= SECOND)
        {
            self.second.pop_front();
        }
        while self
            .minute
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= MINUTE)
        {
            self.minute.pop_front();
        }
    }

    fn record(&mut self, now: Instant) {
        self.second.push_back(now);
        self.minute.push_back(now);
    }

    /// Time until both windows have headroom, or `None` if they do now.
    fn wait_time(&self, now: Instant, config: &RateLimitConfig) -> Option<Duration> {
        let mut wait = Duration::ZERO;

        if config.requests_per_second > 0
            && self.second.len() >= config.requests_per_second as usize
            && let Some(oldest) = self.second.front()
        {
            wait = wait.max(SECOND.saturating_sub(now.saturating_duration_since(*oldest)));
        }

        if config.requests_per_minute > 0
            && self.minute.len() >= config.requests_per_minute as usize
            && let Some(oldest) = self.minute.front()
        {
            wait = wait.max(MINUTE.saturating_sub(now.saturating_duration_since(*oldest)));
        }

        (!wait.is_zero()).then_some(wait)
    }
}

#[derive(Debug)]
struct Shared {
    config: RateLimitConfig,
    /// Held across the whole admission wait; gives FIFO order.
    turn: tokio::sync::Mutex<()>,
    /// Only ever locked briefly, never across an await.
    window: Mutex<Window>,
    cooldown_until: Mutex<Option<Instant>>,
    retries: Mutex<HashMap<String, u32>>,
}

/// Occupancy snapshot for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateLimiterStats {
    pub in_last_second: usize,
    pub in_last_minute: usize,
    pub tracked_retries: usize,
    pub cooling_down: bool,
}

/// Shared admission controller. Cheap to clone; clones share one window.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                turn: tokio::sync::Mutex::new(()),
                window: Mutex::new(Window::default()),
                cooldown_until: Mutex::new(None),
                retries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    fn lock_retries(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.inner.retries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned retry table");
            poisoned.into_inner()
        })
    }

    fn lock_window(&self) -> MutexGuard<'_, Window> {
        self.inner
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cooldown(&self) -> MutexGuard<'_, Option<Instant>> {
        self.inner
            .cooldown_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let cooldown = *self.lock_cooldown();
        cooldown
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Wait until both quotas have headroom, then record this admission.
    ///
    /// The turn lock is held across the wait, so concurrent callers are
    /// admitted one at a time in arrival order. The window itself is only
    /// locked between sleeps, which keeps [`stats`](Self::stats) prompt.
    /// Returns the time spent waiting.
    pub async fn await_admission(&self) -> Duration {
        let started = Instant::now();
        let _turn = self.inner.turn.lock().await;

        loop {
            let now = Instant::now();
            let (wait, in_last_second, in_last_minute) = {
                let mut window = self.lock_window();
                window.prune(now);

                let quota_wait = window.wait_time(now, &self.inner.config);
                match (quota_wait, self.cooldown_remaining(now)) {
                    (None, None) => {
                        window.record(now);
                        break;
                    }
                    (a, b) => (
                        a.unwrap_or_default().max(b.unwrap_or_default()),
                        window.second.len(),
                        window.minute.len(),
                    ),
                }
            };

            tracing::debug!(
                wait_ms = %wait.as_millis(),
                in_last_second,
                in_last_minute,
                "Waiting for admission"
            );
            tokio::time::sleep(wait).await;
        }

        started.elapsed()
    }

    /// Backoff delay for a given attempt, without sleeping.
    ///
    /// `min(base * 2^attempt ± jitter, max_delay)`, floored at zero; attempt 0
    /// is always zero.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let config = &self.inner.config;

        let factor = 2u64.saturating_pow(attempt);
        let exp_ms = (config.base_delay.as_millis() as u64).saturating_mul(factor);

        let jitter_ms = config.jitter.as_millis() as i64;
        let offset = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(-jitter_ms..=jitter_ms)
        };

        let exp_ms = exp_ms.min(i64::MAX as u64) as i64;
        let delay_ms = exp_ms.saturating_add(offset).max(0) as u64;
        Duration::from_millis(delay_ms).min(config.max_delay)
    }

    /// Sleep for the backoff delay of `attempt`.
    pub async fn await_backoff(&self, request_id: &str, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !delay.is_zero() {
            tracing::debug!(%request_id, attempt, delay_ms = %delay.as_millis(), "Backing off");
            tokio::time::sleep(delay).await;
        }
        delay
    }

    /// True while `request_id` has retries left.
    pub fn should_retry(&self, request_id: &str) -> bool {
        let count = self.lock_retries().get(request_id).copied().unwrap_or(0);
        count < self.inner.config.max_retries
    }

    /// Count one retry for `request_id`; returns the new count.
    pub fn register_retry(&self, request_id: &str) -> u32 {
        let mut retries = self.lock_retries();
        let count = retries.entry(request_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn retry_count(&self, request_id: &str) -> u32 {
        self.lock_retries().get(request_id).copied().unwrap_or(0)
    }

    /// Forget retry bookkeeping for a finished request.
    pub fn reset(&self, request_id: &str) {
        self.lock_retries().remove(request_id);
    }

    /// Hold every admission for a while after the service signalled overload.
    ///
    /// Uses the server-provided `retry_after` when known, otherwise the base
    /// backoff delay. Never shortens an existing cooldown.
    pub fn slow_down(&self, retry_after: Option<Duration>) {
        let pause = retry_after
            .unwrap_or(self.inner.config.base_delay)
            .min(self.inner.config.max_delay);
        let until = Instant::now() + pause;

        let mut cooldown = self.lock_cooldown();
        if (*cooldown).is_none_or(|current| current < until) {
            tracing::info!(pause_ms = %pause.as_millis(), "Inference service throttled us, pausing admissions");
            *cooldown = Some(until);
        }
    }

    /// Current window occupancy. Never waits on a parked admission.
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let (in_last_second, in_last_minute) = {
            let mut window = self.lock_window();
            window.prune(now);
            (window.second.len(), window.minute.len())
        };
        RateLimiterStats {
            in_last_second,
            in_last_minute,
            tracked_retries: self.lock_retries().len(),
            cooling_down: self.cooldown_remaining(now).is_some(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_second: u32, per_minute: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: per_second,
            requests_per_minute: per_minute,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: Duration::ZERO,
            max_retries: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_within_quota_are_immediate() {
        let limiter = RateLimiter::new(config(10, 100));
        for _ in 0..5 {
            assert_eq!(limiter.await_admission().await, Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_beyond_minute_quota_is_delayed() {
        let limiter = RateLimiter::new(config(100, 3));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.await_admission().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        let waited = limiter.await_admission().await;
        assert!(waited > Duration::ZERO);
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn request_beyond_second_quota_is_delayed() {
        let limiter = RateLimiter::new(config(2, 100));
        limiter.await_admission().await;
        limiter.await_admission().await;

        let waited = limiter.await_admission().await;
        assert!(waited >= Duration::from_millis(900));
        assert!(waited <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_window() {
        let limiter = RateLimiter::new(config(1, 100));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.await_admission().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // 4 admissions at 1/s need at least 3 full seconds in aggregate.
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(limiter.stats().in_last_minute, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_answer_while_an_admission_is_parked() {
        let limiter = RateLimiter::new(config(0, 1));
        limiter.await_admission().await;

        let parked = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.await_admission().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!parked.is_finished());

        let stats = limiter.stats();
        assert_eq!(stats.in_last_minute, 1);
        assert!(!stats.cooling_down);

        let waited = parked.await.unwrap();
        assert!(waited >= Duration::from_secs(54));
        assert_eq!(limiter.stats().in_last_minute, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_down_delays_next_admission() {
        let limiter = RateLimiter::new(config(100, 100));
        limiter.slow_down(Some(Duration::from_secs(2)));
        assert!(limiter.stats().cooling_down);

        let waited = limiter.await_admission().await;
        assert!(waited >= Duration::from_secs(2));
    }

    #[test]
    fn backoff_attempt_zero_is_immediate() {
        let limiter = RateLimiter::new(config(1, 1));
        assert_eq!(limiter.backoff_delay(0), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let limiter = RateLimiter::new(config(1, 1));
        assert_eq!(limiter.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(limiter.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(limiter.backoff_delay(10), Duration::from_secs(5));
        assert_eq!(limiter.backoff_delay(64), Duration::from_secs(5));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let limiter = RateLimiter::new(RateLimitConfig {
            jitter: Duration::from_millis(50),
            ..config(1, 1)
        });
        for _ in 0..200 {
            let d = limiter.backoff_delay(1);
            assert!(d >= Duration::from_millis(150), "{d:?}");
            assert!(d <= Duration::from_millis(250), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn await_backoff_sleeps_for_delay() {
        let limiter = RateLimiter::new(config(1, 1));
        let start = Instant::now();
        let delay = limiter.await_backoff("req", 2).await;
        assert_eq!(delay, Duration::from_millis(400));
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn retry_bookkeeping_respects_ceiling_and_resets() {
        let limiter = RateLimiter::new(config(1, 1));
        assert!(limiter.should_retry("batch-1"));

        assert_eq!(limiter.register_retry("batch-1"), 1);
        assert!(limiter.should_retry("batch-1"));
        assert_eq!(limiter.register_retry("batch-1"), 2);
        assert!(!limiter.should_retry("batch-1"));
        assert!(limiter.should_retry("batch-2"));

        limiter.reset("batch-1");
        assert_eq!(limiter.retry_count("batch-1"), 0);
        assert!(limiter.should_retry("batch-1"));
    }
}
