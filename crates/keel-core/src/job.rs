use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "processing" => Ok(JobStatus::Processing),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A tracked unit of long-running work.
///
/// `completed_at` is set iff the status is terminal; `results` is set iff
/// the status is `Complete`. Only [`JobRegistry`](crate::registry::JobRegistry)
/// mutates these records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub results: Option<serde_json::Value>,
}

impl Job {
    /// A fresh record in the `processing` state at 0%.
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Processing,
            progress: 0,
            message: "Job created".to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            results: None,
        }
    }

    /// Storage key for a job record.
    pub fn key(id: Uuid) -> String {
        format!("job:{id}")
    }
}

/// Outcome of a results query. Unknown, still running, and failed jobs are
/// distinct answers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsLookup {
    NotFound,
    Processing { progress: u8, message: String },
    Failed { error: String },
    Ready(serde_json::Value),
}
