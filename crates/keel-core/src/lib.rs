pub mod attempt;
pub mod batch;
pub mod config;
pub mod error;
pub mod identity;
pub mod job;
pub mod monitor;
pub mod pipeline;
pub mod rate_limit;
pub mod registry;
pub mod scrape;
pub mod store;
pub mod traits;
pub mod util;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use attempt::{Attempt, run_with_retry};
pub use batch::{Batch, BatchConfig, BatchOrchestrator, BatchOutcome};
pub use error::AppError;
pub use job::{Job, JobStatus, ResultsLookup};
pub use monitor::RequestMonitor;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::JobRegistry;
pub use traits::{Cleaner, Fetcher, Inference, KvStore};
pub use util::compute_hash;
pub use worker::{JobApi, JobRunner, Pipeline};
