//! Batched, admission-gated execution of large item collections.
//!
//! ```text
//! items ──partition──> [b0][b1][b2] ... [bN]
//!                        │   │   │        │      one task per batch,
//!                        ▼   ▼   ▼        ▼      at most `concurrency` running
//!                 await_admission() ─> process_fn(batch) ─┐
//!                        ▲                                │ Retryable
//!                        └──── await_backoff() <──────────┘
//!
//! results ──sort by batch index──> combine_fn ──> BatchOutcome
//! ```
//!
//! Batches fail independently. Permanently failed batches are reported in
//! the [`BatchOutcome`] and their items counted as dropped; only a run in
//! which *every* batch fails is an error.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::attempt::{Attempt, run_with_retry};
use crate::error::AppError;
use crate::monitor::RequestMonitor;
use crate::rate_limit::RateLimiter;
use crate::util::panic_message;

/// Sizing for a batched run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum items per batch.
    pub batch_size: usize,

    /// Maximum batches in flight at once.
    pub concurrency: usize,

    /// Ceiling for a single attempt at a single batch.
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            concurrency: 4,
            batch_timeout: Duration::from_secs(120),
        }
    }
}

impl BatchConfig {
    /// Smaller batches, fewer workers, more patience.
    pub fn degraded(&self) -> Self {
        Self {
            batch_size: (self.batch_size / 2).max(1),
            concurrency: (self.concurrency / 2).max(1),
            batch_timeout: self.batch_timeout.saturating_mul(2),
        }
    }
}

/// A bounded slice of the input, handed to `process_fn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub index: usize,
    pub items: Vec<T>,
    /// Retries already spent on this batch (0 on the first attempt).
    pub retry_count: u32,
}

/// A batch that exhausted its retries or failed fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBatch {
    pub index: usize,
    pub item_count: usize,
    pub error: String,
}

#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub aggregate: R,
    pub total_batches: usize,
    pub succeeded_batches: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub dropped_items: usize,
}

impl<R> BatchOutcome<R> {
    /// True when no batch was dropped.
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty()
    }
}

/// Split `items` into ordered batches of at most `batch_size` items.
pub fn partition<T>(items: Vec<T>, batch_size: usize) -> Vec<Batch<T>> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();

    while iter.peek().is_some() {
        let items: Vec<T> = iter.by_ref().take(size).collect();
        batches.push(Batch {
            index: batches.len(),
            items,
            retry_count: 0,
        });
    }
    batches
}

/// Ordered successes plus failures, before `combine_fn` runs.
struct Collected<O> {
    outputs: Vec<O>,
    total_batches: usize,
    failed: Vec<FailedBatch>,
}

struct BatchTask<PF> {
    process_fn: Arc<PF>,
    limiter: RateLimiter,
    monitor: RequestMonitor,
    permits: Arc<Semaphore>,
    agent: String,
    request_id: String,
    timeout: Duration,
}

/// Runs batched workloads through a shared [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    name: String,
    limiter: RateLimiter,
    monitor: RequestMonitor,
}

impl BatchOrchestrator {
    /// `name` is the agent name used for monitoring and request ids.
    pub fn new(name: impl Into<String>, limiter: RateLimiter, monitor: RequestMonitor) -> Self {
        Self {
            name: name.into(),
            limiter,
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process `items` in batches and combine the successful outputs in
    /// input order.
    pub async fn process<T, O, R, PF, Fut, CF>(
        &self,
        items: Vec<T>,
        process_fn: PF,
        combine_fn: CF,
        config: &BatchConfig,
    ) -> Result<BatchOutcome<R>, AppError>
    where
        T: Clone + Send + Sync + 'static,
        O: Send + 'static,
        PF: Fn(Batch<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, AppError>> + Send + 'static,
        CF: FnOnce(Vec<O>) -> R,
    {
        let collected = self.run(items, Arc::new(process_fn), config).await?;
        Ok(Self::finish(collected, combine_fn))
    }

    /// Like [`process`](Self::process), but if the run fails as a whole it
    /// is retried once under [`BatchConfig::degraded`].
    pub async fn process_with_fallback<T, O, R, PF, Fut, CF>(
        &self,
        items: Vec<T>,
        process_fn: PF,
        combine_fn: CF,
        config: &BatchConfig,
    ) -> Result<BatchOutcome<R>, AppError>
    where
        T: Clone + Send + Sync + 'static,
        O: Send + 'static,
        PF: Fn(Batch<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, AppError>> + Send + 'static,
        CF: FnOnce(Vec<O>) -> R,
    {
        let process_fn = Arc::new(process_fn);

        let collected = match self.run(items.clone(), process_fn.clone(), config).await {
            Ok(collected) => collected,
            Err(e) => {
                let degraded = config.degraded();
                tracing::warn!(
                    orchestrator = %self.name,
                    error = %e,
                    batch_size = degraded.batch_size,
                    concurrency = degraded.concurrency,
                    "Batched run failed, retrying with degraded configuration"
                );
                self.run(items, process_fn, &degraded).await?
            }
        };

        Ok(Self::finish(collected, combine_fn))
    }

    fn finish<O, R, CF>(collected: Collected<O>, combine_fn: CF) -> BatchOutcome<R>
    where
        CF: FnOnce(Vec<O>) -> R,
    {
        let succeeded_batches = collected.outputs.len();
        let dropped_items = collected.failed.iter().map(|f| f.item_count).sum();
        BatchOutcome {
            aggregate: combine_fn(collected.outputs),
            total_batches: collected.total_batches,
            succeeded_batches,
            failed_batches: collected.failed,
            dropped_items,
        }
    }

    async fn run<T, O, PF, Fut>(
        &self,
        items: Vec<T>,
        process_fn: Arc<PF>,
        config: &BatchConfig,
    ) -> Result<Collected<O>, AppError>
    where
        T: Clone + Send + Sync + 'static,
        O: Send + 'static,
        PF: Fn(Batch<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, AppError>> + Send + 'static,
    {
        let item_count = items.len();
        let batches = partition(items, config.batch_size);
        let total = batches.len();
        if total == 0 {
            return Ok(Collected {
                outputs: Vec::new(),
                total_batches: 0,
                failed: Vec::new(),
            });
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let run_id = &run_id[..8];
        tracing::info!(
            orchestrator = %self.name,
            %run_id,
            items = item_count,
            batches = total,
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            "Starting batched run"
        );

        let sizes: Vec<usize> = batches.iter().map(|b| b.items.len()).collect();
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

        // Dropping the set aborts any batch still running.
        let mut set = JoinSet::new();
        for batch in batches {
            let task = BatchTask {
                process_fn: process_fn.clone(),
                limiter: self.limiter.clone(),
                monitor: self.monitor.clone(),
                permits: permits.clone(),
                agent: self.name.clone(),
                request_id: format!("{}:{}:{}", self.name, run_id, batch.index),
                timeout: config.batch_timeout,
            };
            set.spawn(run_batch(task, batch));
        }

        let mut outputs: Vec<Option<O>> = (0..total).map(|_| None).collect();
        let mut errors: Vec<Option<String>> = vec![None; total];

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(output))) => outputs[index] = Some(output),
                Ok((index, Err(e))) => {
                    tracing::warn!(orchestrator = %self.name, %run_id, batch = index, error = %e, "Batch failed permanently");
                    errors[index] = Some(e.to_string());
                }
                Err(e) => {
                    tracing::error!(orchestrator = %self.name, %run_id, error = %e, "Batch task aborted");
                }
            }
        }

        let mut ordered = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for (index, output) in outputs.into_iter().enumerate() {
            match output {
                Some(output) => ordered.push(output),
                None => failed.push(FailedBatch {
                    index,
                    item_count: sizes[index],
                    error: errors[index]
                        .take()
                        .unwrap_or_else(|| "batch task aborted".to_string()),
                }),
            }
        }

        if ordered.is_empty() {
            let summary = failed
                .iter()
                .take(3)
                .map(|f| format!("batch {}: {}", f.index, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AppError::AllBatchesFailed {
                batches: total,
                summary,
            });
        }

        if failed.is_empty() {
            tracing::info!(orchestrator = %self.name, %run_id, batches = total, "Batched run complete");
        } else {
            tracing::warn!(
                orchestrator = %self.name,
                %run_id,
                failed = failed.len(),
                batches = total,
                dropped_items = failed.iter().map(|f| f.item_count).sum::<usize>(),
                "Batched run partially complete"
            );
        }

        Ok(Collected {
            outputs: ordered,
            total_batches: total,
            failed,
        })
    }
}

async fn run_batch<T, O, PF, Fut>(task: BatchTask<PF>, batch: Batch<T>) -> (usize, Result<O, AppError>)
where
    T: Clone + Send + Sync + 'static,
    O: Send + 'static,
    PF: Fn(Batch<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, AppError>> + Send + 'static,
{
    let index = batch.index;
    let Ok(_permit) = task.permits.clone().acquire_owned().await else {
        return (index, Err(AppError::Generic("batch pool closed".to_string())));
    };

    let timeout = task.timeout;
    let result = run_with_retry(
        &task.limiter,
        &task.monitor,
        &task.agent,
        &task.request_id,
        |attempt| {
            let process_fn = task.process_fn.clone();
            let mut batch = batch.clone();
            batch.retry_count = attempt;

            async move {
                let call = AssertUnwindSafe(async move { (*process_fn)(batch).await }).catch_unwind();
                match tokio::time::timeout(timeout, call).await {
                    Err(_) => Attempt::Retryable(AppError::Timeout(timeout.as_secs())),
                    Ok(Err(panic)) => Attempt::Fatal(AppError::Generic(format!(
                        "batch panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                    Ok(Ok(result)) => Attempt::from_result(result),
                }
            }
        },
    )
    .await;

    (index, result)
}
