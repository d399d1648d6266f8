//! Detached job execution.
//!
//! [`JobRunner`] is the only thing the request layer talks to: `submit`
//! validates and persists a job, then hands the work to a tracked tokio
//! task and returns immediately. Every suspension point (admission, backoff,
//! pacing) lives inside that task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus, ResultsLookup};
use crate::registry::JobRegistry;
use crate::traits::KvStore;
use crate::util::panic_message;

/// Events emitted by the runner for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    JobSubmitted {
        job_id: Uuid,
        pipeline: &'a str,
    },
    JobStarted {
        job_id: Uuid,
    },
    JobCompleted {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
    },
    JobPanicked {
        job_id: Uuid,
        message: &'a str,
    },
    ShuttingDown {
        in_flight: usize,
    },
    Stopped {
        drained: bool,
    },
}

impl WorkerEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::JobSubmitted { .. } => "job_submitted",
            WorkerEvent::JobStarted { .. } => "job_started",
            WorkerEvent::JobCompleted { .. } => "job_completed",
            WorkerEvent::JobFailed { .. } => "job_failed",
            WorkerEvent::JobPanicked { .. } => "job_panicked",
            WorkerEvent::ShuttingDown { .. } => "shutting_down",
            WorkerEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync + 'static {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::JobSubmitted { job_id, pipeline } => {
                tracing::info!(%job_id, %pipeline, "Job submitted");
            }
            WorkerEvent::JobStarted { job_id } => {
                tracing::info!(%job_id, "Processing job");
            }
            WorkerEvent::JobCompleted { job_id } => {
                tracing::info!(%job_id, "Job completed");
            }
            WorkerEvent::JobFailed { job_id, error } => {
                tracing::warn!(%job_id, %error, "Job failed");
            }
            WorkerEvent::JobPanicked { job_id, message } => {
                tracing::error!(%job_id, %message, "Job panicked");
            }
            WorkerEvent::ShuttingDown { in_flight } => {
                tracing::info!(%in_flight, "Worker shutting down");
            }
            WorkerEvent::Stopped { drained } => {
                tracing::info!(%drained, "Worker stopped");
            }
        }
    }
}

/// Where a running pipeline reports progress.
pub trait ProgressSink: Send + Sync {
    fn update(&self, progress: u8, message: &str) -> impl Future<Output = ()> + Send;
}

/// [`ProgressSink`] that writes through to the job registry.
///
/// Store failures are logged and swallowed: losing a progress tick must not
/// fail the job.
#[derive(Debug, Clone)]
pub struct JobProgress<S> {
    registry: JobRegistry<S>,
    job_id: Uuid,
}

impl<S: KvStore> JobProgress<S> {
    pub fn new(registry: JobRegistry<S>, job_id: Uuid) -> Self {
        Self { registry, job_id }
    }
}

impl<S: KvStore> ProgressSink for JobProgress<S> {
    async fn update(&self, progress: u8, message: &str) {
        if let Err(e) = self
            .registry
            .update_status(self.job_id, JobStatus::Processing, progress, message)
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to record progress");
        }
    }
}

/// A unit of long-running work that a [`JobRunner`] executes per job.
pub trait Pipeline: Send + Sync + 'static {
    /// Submission parameters.
    type Params: DeserializeOwned + Send + 'static;

    fn name(&self) -> &str;

    /// Reject malformed parameters before any job is created.
    fn validate(&self, params: &Self::Params) -> Result<(), AppError>;

    /// Do the work, returning the results blob stored on completion.
    fn run<P: ProgressSink + 'static>(
        &self,
        job_id: Uuid,
        params: Self::Params,
        progress: P,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Object-safe job lifecycle surface for the request layer.
pub trait JobApi: Send + Sync {
    /// Validate raw parameters, create a job and start it in the background.
    fn submit(&self, params: serde_json::Value) -> BoxFuture<'_, Result<Uuid, AppError>>;

    fn status(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<Job>, AppError>>;

    fn results(&self, job_id: Uuid) -> BoxFuture<'_, Result<ResultsLookup, AppError>>;
}

/// Runs a [`Pipeline`] per submitted job on detached, tracked tasks.
pub struct JobRunner<S, P> {
    registry: JobRegistry<S>,
    pipeline: Arc<P>,
    tracker: TaskTracker,
    reporter: Arc<dyn WorkerReporter>,
}

impl<S: Clone, P> Clone for JobRunner<S, P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            pipeline: self.pipeline.clone(),
            tracker: self.tracker.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

impl<S: KvStore, P: Pipeline> JobRunner<S, P> {
    pub fn new(registry: JobRegistry<S>, pipeline: P) -> Self {
        Self {
            registry,
            pipeline: Arc::new(pipeline),
            tracker: TaskTracker::new(),
            reporter: Arc::new(TracingWorkerReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: impl WorkerReporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn registry(&self) -> &JobRegistry<S> {
        &self.registry
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Validate, create the job record, and start the pipeline detached.
    pub async fn submit(&self, params: P::Params) -> Result<Uuid, AppError> {
        self.pipeline.validate(&params)?;
        let job_id = self.registry.create_job().await?;

        self.reporter.report(WorkerEvent::JobSubmitted {
            job_id,
            pipeline: self.pipeline.name(),
        });

        let registry = self.registry.clone();
        let pipeline = self.pipeline.clone();
        let reporter = self.reporter.clone();
        self.tracker
            .spawn(execute(registry, pipeline, reporter, job_id, params));

        Ok(job_id)
    }

    /// Like [`submit`](Self::submit), decoding the parameters first.
    pub async fn submit_json(&self, params: serde_json::Value) -> Result<Uuid, AppError> {
        let params: P::Params = serde_json::from_value(params)
            .map_err(|e| AppError::InvalidInput(format!("invalid job parameters: {e}")))?;
        self.submit(params).await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        self.registry.get_job(job_id).await
    }

    pub async fn results(&self, job_id: Uuid) -> Result<ResultsLookup, AppError> {
        self.registry.get_results(job_id).await
    }

    /// Close the tracker and wait up to `grace` for running jobs.
    /// Returns whether everything drained in time; jobs still running are
    /// left to the runtime.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        self.reporter.report(WorkerEvent::ShuttingDown {
            in_flight: self.tracker.len(),
        });

        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        self.reporter.report(WorkerEvent::Stopped { drained });
        drained
    }
}

impl<S: KvStore, P: Pipeline> JobApi for JobRunner<S, P> {
    fn submit(&self, params: serde_json::Value) -> BoxFuture<'_, Result<Uuid, AppError>> {
        Box::pin(self.submit_json(params))
    }

    fn status(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<Job>, AppError>> {
        Box::pin(JobRunner::status(self, job_id))
    }

    fn results(&self, job_id: Uuid) -> BoxFuture<'_, Result<ResultsLookup, AppError>> {
        Box::pin(JobRunner::results(self, job_id))
    }
}

/// Run one job to a terminal state.
///
/// The pipeline runs on its own task so a panic surfaces as a `JoinError`
/// here instead of unwinding through the tracker.
async fn execute<S: KvStore, P: Pipeline>(
    registry: JobRegistry<S>,
    pipeline: Arc<P>,
    reporter: Arc<dyn WorkerReporter>,
    job_id: Uuid,
    params: P::Params,
) {
    reporter.report(WorkerEvent::JobStarted { job_id });

    let progress = JobProgress::new(registry.clone(), job_id);
    let handle = tokio::spawn(async move { pipeline.run(job_id, params, progress).await });

    let recorded = match handle.await {
        Ok(Ok(results)) => match registry.complete(job_id, results).await {
            Ok(()) => {
                reporter.report(WorkerEvent::JobCompleted { job_id });
                Ok(())
            }
            Err(e) => {
                let error = format!("failed to store results: {e}");
                reporter.report(WorkerEvent::JobFailed {
                    job_id,
                    error: &error,
                });
                registry.mark_failed(job_id, &error).await
            }
        },
        Ok(Err(e)) => {
            let error = e.to_string();
            reporter.report(WorkerEvent::JobFailed {
                job_id,
                error: &error,
            });
            registry.mark_failed(job_id, &error).await
        }
        Err(join_error) => {
            let message = if join_error.is_panic() {
                panic_message(join_error.into_panic().as_ref())
            } else {
                "task cancelled".to_string()
            };
            reporter.report(WorkerEvent::JobPanicked {
                job_id,
                message: &message,
            });
            registry
                .mark_failed(job_id, &format!("worker panicked: {message}"))
                .await
        }
    };

    if let Err(e) = recorded {
        tracing::error!(%job_id, error = %e, "Failed to record job outcome");
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::store::{FallbackStore, MemoryStore};
    use crate::testutil::{FailingStore, MockReporter, SwitchableStore};

    #[derive(Debug, Deserialize)]
    struct EchoParams {
        value: i64,
        #[serde(default)]
        mode: Option<String>,
    }

    struct EchoPipeline;

    impl Pipeline for EchoPipeline {
        type Params = EchoParams;

        fn name(&self) -> &str {
            "echo"
        }

        fn validate(&self, params: &EchoParams) -> Result<(), AppError> {
            if params.value < 0 {
                return Err(AppError::InvalidInput("value must be positive".into()));
            }
            Ok(())
        }

        async fn run<P: ProgressSink + 'static>(
            &self,
            _job_id: Uuid,
            params: EchoParams,
            progress: P,
        ) -> Result<serde_json::Value, AppError> {
            progress.update(50, "Echoing").await;
            match params.mode.as_deref() {
                Some("fail") => Err(AppError::AllBatchesFailed {
                    batches: 2,
                    summary: "batch 0: overloaded".into(),
                }),
                Some("panic") => panic!("pipeline blew up"),
                Some("hang") => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(serde_json::json!({}))
                }
                _ => Ok(serde_json::json!({ "value": params.value })),
            }
        }
    }

    fn runner() -> JobRunner<MemoryStore, EchoPipeline> {
        JobRunner::new(JobRegistry::new(MemoryStore::new()), EchoPipeline)
    }

    async fn wait_terminal<S: KvStore, P: Pipeline>(runner: &JobRunner<S, P>, id: Uuid) -> Job {
        for _ in 0..200 {
            let job = runner.status(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn successful_run_completes_the_job() {
        let runner = runner();
        let id = runner
            .submit(EchoParams {
                value: 7,
                mode: None,
            })
            .await
            .unwrap();

        let job = wait_terminal(&runner, id).await;
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.progress, 100);
        assert_eq!(
            runner.results(id).await.unwrap(),
            ResultsLookup::Ready(serde_json::json!({ "value": 7 }))
        );
    }

    #[tokio::test]
    async fn failing_run_marks_the_job_failed() {
        let runner = runner();
        let id = runner
            .submit_json(serde_json::json!({ "value": 1, "mode": "fail" }))
            .await
            .unwrap();

        let job = wait_terminal(&runner, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("All 2 batches failed"));
    }

    #[tokio::test]
    async fn panicking_run_marks_the_job_failed() {
        let reporter = MockReporter::new();
        let runner = runner().with_reporter(reporter.clone());
        let id = runner
            .submit_json(serde_json::json!({ "value": 1, "mode": "panic" }))
            .await
            .unwrap();

        let job = wait_terminal(&runner, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert!(error.starts_with("worker panicked"));
        assert!(error.contains("pipeline blew up"));
        assert!(reporter.events().contains(&"job_panicked"));
    }

    #[tokio::test]
    async fn invalid_params_never_create_a_job() {
        let store = MemoryStore::new();
        let runner = JobRunner::new(JobRegistry::new(store.clone()), EchoPipeline);

        let err = runner
            .submit(EchoParams {
                value: -1,
                mode: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = runner
            .submit_json(serde_json::json!({ "nope": true }))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn submit_fails_when_no_store_is_reachable() {
        let runner = JobRunner::new(JobRegistry::new(FailingStore::new()), EchoPipeline);
        let err = runner
            .submit(EchoParams {
                value: 1,
                mode: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StoreError(_)));
    }

    #[tokio::test]
    async fn job_api_facade_delegates() {
        let runner = runner();
        let api: Arc<dyn JobApi> = Arc::new(runner.clone());

        let id = api.submit(serde_json::json!({ "value": 3 })).await.unwrap();
        wait_terminal(&runner, id).await;

        assert!(api.status(id).await.unwrap().is_some());
        assert!(matches!(
            api.results(id).await.unwrap(),
            ResultsLookup::Ready(_)
        ));
        assert_eq!(
            api.results(Uuid::new_v4()).await.unwrap(),
            ResultsLookup::NotFound
        );
    }

    #[tokio::test]
    async fn shutdown_drains_finished_work() {
        let reporter = MockReporter::new();
        let runner = runner().with_reporter(reporter.clone());
        let id = runner
            .submit(EchoParams {
                value: 1,
                mode: None,
            })
            .await
            .unwrap();

        assert!(runner.shutdown(Duration::from_secs(5)).await);
        assert_eq!(
            runner.status(id).await.unwrap().unwrap().status,
            JobStatus::Complete
        );
        let events = reporter.events();
        assert_eq!(events.first(), Some(&"job_submitted"));
        assert_eq!(events.last(), Some(&"stopped"));
        assert!(events.contains(&"job_started"));
        assert!(events.contains(&"job_completed"));
    }

    #[tokio::test]
    async fn shutdown_gives_up_after_grace() {
        let runner = runner();
        let id = runner
            .submit_json(serde_json::json!({ "value": 1, "mode": "hang" }))
            .await
            .unwrap();

        assert!(!runner.shutdown(Duration::from_millis(20)).await);
        assert_eq!(
            runner.status(id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn job_finishes_when_primary_store_drops_mid_run() {
        let primary = SwitchableStore::new(MemoryStore::new());
        let registry = JobRegistry::new(FallbackStore::new(primary.clone(), MemoryStore::new()));
        let runner = JobRunner::new(registry, EchoPipeline);

        let id = runner
            .submit(EchoParams {
                value: 5,
                mode: None,
            })
            .await
            .unwrap();
        // The job task has not been polled yet on this single-threaded runtime.
        primary.set_down(true);
        assert!(runner.shutdown(Duration::from_secs(5)).await);
        primary.set_down(false);

        let job = runner.status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(
            runner.results(id).await.unwrap(),
            ResultsLookup::Ready(serde_json::json!({ "value": 5 }))
        );
    }

    #[tokio::test]
    async fn progress_sink_swallows_store_errors() {
        let progress = JobProgress::new(JobRegistry::new(FailingStore::new()), Uuid::new_v4());
        progress.update(10, "ignored").await;
    }
}
