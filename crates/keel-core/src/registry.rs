//! Persisted job records with polling reads.
//!
//! Each job is one JSON document under `job:{id}`. Writes replace the whole
//! document (atomic per key); only the worker that owns a job writes to it,
//! so no read-modify-write merging is attempted.
//!
//! Terminal records are final: `update_status` and `save_results` refuse
//! them, and `complete` is the only way into `complete`, so `results` is
//! present exactly when a job completed.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus, ResultsLookup};
use crate::traits::KvStore;

/// Default retention for job records.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct JobRegistry<S> {
    store: S,
    ttl: Option<Duration>,
}

impl<S: KvStore> JobRegistry<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            ttl: Some(DEFAULT_JOB_TTL),
        }
    }

    /// Override the record TTL. `None` keeps records until deleted externally.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn create_job(&self) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        let job = Job::new(id);
        self.write(&job).await?;
        tracing::debug!(job_id = %id, "Job created");
        Ok(id)
    }

    /// Overwrite status, progress and message.
    ///
    /// A call that matches the stored state is a no-op, `updated_at`
    /// included. Moving to `complete` goes through [`complete`](Self::complete).
    pub async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: u8,
        message: &str,
    ) -> Result<(), AppError> {
        if status == JobStatus::Complete {
            return Err(AppError::InvalidTransition(format!(
                "job {job_id}: use complete() to attach results and finish"
            )));
        }

        let mut job = self.require(job_id).await?;
        let progress = progress.min(100);

        if job.status == status && job.progress == progress && job.message == message {
            return Ok(());
        }
        Self::ensure_open(&job)?;

        let now = Utc::now();
        job.status = status;
        job.progress = progress;
        job.message = message.to_string();
        job.updated_at = now;
        job.completed_at = status.is_terminal().then_some(now);
        if status == JobStatus::Failed {
            job.results = None;
        }

        self.write(&job).await
    }

    /// Attach a results blob without touching the status.
    pub async fn save_results(
        &self,
        job_id: Uuid,
        results: serde_json::Value,
    ) -> Result<(), AppError> {
        let mut job = self.require(job_id).await?;
        Self::ensure_open(&job)?;
        job.results = Some(results);
        job.updated_at = Utc::now();
        self.write(&job).await
    }

    /// Attach results and move to `complete` in a single write.
    pub async fn complete(&self, job_id: Uuid, results: serde_json::Value) -> Result<(), AppError> {
        let mut job = self.load_for_outcome(job_id).await?;
        let now = Utc::now();
        job.status = JobStatus::Complete;
        job.progress = 100;
        job.message = "Analysis complete".to_string();
        job.results = Some(results);
        job.error = None;
        job.updated_at = now;
        job.completed_at = Some(now);
        self.write(&job).await
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<(), AppError> {
        let mut job = self.load_for_outcome(job_id).await?;
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.message = "Job failed".to_string();
        job.error = Some(error.to_string());
        job.results = None;
        job.updated_at = now;
        job.completed_at = Some(now);
        self.write(&job).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        match self.store.get(&Job::key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_results(&self, job_id: Uuid) -> Result<ResultsLookup, AppError> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(ResultsLookup::NotFound);
        };

        Ok(match job.status {
            JobStatus::Processing => ResultsLookup::Processing {
                progress: job.progress,
                message: job.message,
            },
            JobStatus::Failed => ResultsLookup::Failed {
                error: job.error.unwrap_or_else(|| "unknown error".to_string()),
            },
            JobStatus::Complete => match job.results {
                Some(results) => ResultsLookup::Ready(results),
                None => ResultsLookup::Failed {
                    error: "job completed without results".to_string(),
                },
            },
        })
    }

    async fn require(&self, job_id: Uuid) -> Result<Job, AppError> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }

    /// Record to finish. When the store cannot answer the read at all, a
    /// fresh record is rebuilt so the outcome still lands in whichever store
    /// accepts the write; a clean miss is still `JobNotFound`.
    async fn load_for_outcome(&self, job_id: Uuid) -> Result<Job, AppError> {
        match self.get_job(job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(AppError::JobNotFound(job_id.to_string())),
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Job record unreadable, rebuilding it to record the outcome");
                Ok(Job::new(job_id))
            }
        }
    }

    fn ensure_open(job: &Job) -> Result<(), AppError> {
        if job.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "job {} is already {}",
                job.id, job.status
            )));
        }
        Ok(())
    }

    async fn write(&self, job: &Job) -> Result<(), AppError> {
        let raw = serde_json::to_string(job)?;
        self.store.set(&Job::key(job.id), &raw, self.ttl).await
    }
}
