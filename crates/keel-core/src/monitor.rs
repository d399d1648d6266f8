//! Passive request metrics.
//!
//! Components report lifecycle events keyed by a logical agent name
//! (`"scraper"`, `"keywords"`, ...) and a request id. Nothing reads these
//! numbers to make decisions; the monitor only answers snapshot queries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Default, Clone)]
struct AgentCounters {
    requests: u64,
    successes: u64,
    errors: u64,
    retries: u64,
    timeouts: u64,
    total_duration: Duration,
}

impl AgentCounters {
    fn merge(&mut self, other: &AgentCounters) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.errors += other.errors;
        self.retries += other.retries;
        self.timeouts += other.timeouts;
        self.total_duration += other.total_duration;
    }

    fn snapshot(&self, in_flight: usize, uptime: Duration) -> AgentSnapshot {
        let finished = self.successes + self.errors;
        let ratio = |n: u64, d: u64| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        let minutes = uptime.as_secs_f64() / 60.0;

        AgentSnapshot {
            requests: self.requests,
            successes: self.successes,
            errors: self.errors,
            retries: self.retries,
            timeouts: self.timeouts,
            in_flight,
            success_rate: ratio(self.successes, finished),
            error_rate: ratio(self.errors, finished),
            retry_rate: ratio(self.retries, self.requests),
            avg_duration_ms: if finished == 0 {
                0.0
            } else {
                self.total_duration.as_secs_f64() * 1000.0 / finished as f64
            },
            throughput_per_minute: if minutes > 0.0 {
                self.successes as f64 / minutes
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug)]
struct MonitorInner {
    started_at: Instant,
    in_flight: HashMap<(String, String), Instant>,
    agents: HashMap<String, AgentCounters>,
}

/// Figures for one agent, or for all agents combined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub in_flight: usize,
    pub success_rate: f64,
    pub error_rate: f64,
    pub retry_rate: f64,
    pub avg_duration_ms: f64,
    pub throughput_per_minute: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub uptime_secs: u64,
    pub overall: AgentSnapshot,
    pub agents: BTreeMap<String, AgentSnapshot>,
}

/// Shared metrics collector. Cheap to clone; clones share counters.
#[derive(Debug, Clone)]
pub struct RequestMonitor {
    inner: Arc<Mutex<MonitorInner>>,
}

impl RequestMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MonitorInner {
                started_at: Instant::now(),
                in_flight: HashMap::new(),
                agents: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_start(&self, agent: &str, request_id: &str) {
        let mut inner = self.lock();
        inner.agents.entry(agent.to_string()).or_default().requests += 1;
        inner
            .in_flight
            .insert((agent.to_string(), request_id.to_string()), Instant::now());
    }

    pub fn record_retry(&self, agent: &str, request_id: &str, reason: &str) {
        tracing::debug!(%agent, %request_id, %reason, "Retrying request");
        self.lock()
            .agents
            .entry(agent.to_string())
            .or_default()
            .retries += 1;
    }

    pub fn record_timeout(&self, agent: &str, request_id: &str) {
        tracing::debug!(%agent, %request_id, "Request attempt timed out");
        self.lock()
            .agents
            .entry(agent.to_string())
            .or_default()
            .timeouts += 1;
    }

    pub fn record_success(&self, agent: &str, request_id: &str) {
        let mut inner = self.lock();
        let elapsed = Self::finish(&mut inner, agent, request_id);
        let counters = inner.agents.entry(agent.to_string()).or_default();
        counters.successes += 1;
        counters.total_duration += elapsed;
    }

    pub fn record_error(&self, agent: &str, request_id: &str, error: &str) {
        tracing::debug!(%agent, %request_id, %error, "Request failed");
        let mut inner = self.lock();
        let elapsed = Self::finish(&mut inner, agent, request_id);
        let counters = inner.agents.entry(agent.to_string()).or_default();
        counters.errors += 1;
        counters.total_duration += elapsed;
    }

    fn finish(inner: &mut MonitorInner, agent: &str, request_id: &str) -> Duration {
        inner
            .in_flight
            .remove(&(agent.to_string(), request_id.to_string()))
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub fn agent_snapshot(&self, agent: &str) -> Option<AgentSnapshot> {
        let inner = self.lock();
        let uptime = inner.started_at.elapsed();
        let in_flight = inner.in_flight.keys().filter(|(a, _)| a == agent).count();
        inner
            .agents
            .get(agent)
            .map(|c| c.snapshot(in_flight, uptime))
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let inner = self.lock();
        let uptime = inner.started_at.elapsed();

        let mut total = AgentCounters::default();
        let mut agents = BTreeMap::new();
        for (name, counters) in &inner.agents {
            total.merge(counters);
            let in_flight = inner.in_flight.keys().filter(|(a, _)| a == name).count();
            agents.insert(name.clone(), counters.snapshot(in_flight, uptime));
        }

        MonitorSnapshot {
            uptime_secs: uptime.as_secs(),
            overall: total.snapshot(inner.in_flight.len(), uptime),
            agents,
        }
    }
}

impl Default for RequestMonitor {
    fn default() -> Self {
        Self::new()
    }
}
