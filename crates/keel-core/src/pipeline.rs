//! Listing analysis: scrape a product page, analyze keywords in batches,
//! then generate listing copy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::attempt::{Attempt, run_with_retry};
use crate::batch::{Batch, BatchConfig, BatchOrchestrator};
use crate::error::AppError;
use crate::monitor::RequestMonitor;
use crate::rate_limit::RateLimiter;
use crate::scrape::{ResilientFetcher, ScrapeAttempt};
use crate::traits::{Cleaner, Fetcher, Inference};
use crate::util::truncate_chars;
use crate::worker::{Pipeline, ProgressSink};

const KEYWORDS_AGENT: &str = "keywords";
const COPY_AGENT: &str = "copy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRow {
    pub keyword: String,
    #[serde(default)]
    pub search_volume: Option<u64>,
}

/// Parameters for one listing analysis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRequest {
    pub product_id: String,
    /// Marketplace host, e.g. `www.amazon.de`.
    #[serde(default)]
    pub marketplace: Option<String>,
    pub keywords: Vec<KeywordRow>,
}

/// One analyzed keyword: the input row plus whatever the model returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordInsight {
    pub keyword: String,
    pub search_volume: Option<u64>,
    pub analysis: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ScrapeSummary {
    status: u16,
    attempts: Vec<ScrapeAttempt>,
}

#[derive(Debug, Serialize)]
struct ListingResults {
    product_id: String,
    listing_url: String,
    scrape: ScrapeSummary,
    keywords: Vec<KeywordInsight>,
    keywords_requested: usize,
    keywords_analyzed: usize,
    keywords_dropped: usize,
    batches_total: usize,
    batches_failed: usize,
    partial: bool,
    copy: String,
}

#[derive(Debug, Clone)]
pub struct ListingConfig {
    /// Used when a request names no marketplace.
    pub default_marketplace: String,
    /// Cleaned listing text is cut to this many characters before prompting.
    pub max_content_chars: usize,
    /// How many analyzed keywords feed the copy prompt.
    pub copy_keywords: usize,
    pub keyword_batch: BatchConfig,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            default_marketplace: "www.amazon.com".to_string(),
            max_content_chars: 12_000,
            copy_keywords: 20,
            keyword_batch: BatchConfig::default(),
        }
    }
}

pub fn listing_url(marketplace: &str, product_id: &str) -> String {
    format!("https://{marketplace}/dp/{product_id}")
}

pub struct ListingPipeline<F, C, I> {
    fetcher: ResilientFetcher<F>,
    cleaner: C,
    inference: I,
    orchestrator: BatchOrchestrator,
    limiter: RateLimiter,
    monitor: RequestMonitor,
    config: ListingConfig,
}

impl<F, C, I> ListingPipeline<F, C, I>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
    I: Inference,
{
    pub fn new(
        fetcher: ResilientFetcher<F>,
        cleaner: C,
        inference: I,
        limiter: RateLimiter,
        monitor: RequestMonitor,
        config: ListingConfig,
    ) -> Self {
        let orchestrator = BatchOrchestrator::new(KEYWORDS_AGENT, limiter.clone(), monitor.clone());
        Self {
            fetcher,
            cleaner,
            inference,
            orchestrator,
            limiter,
            monitor,
            config,
        }
    }

    fn marketplace<'a>(&'a self, request: &'a ListingRequest) -> &'a str {
        request
            .marketplace
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.config.default_marketplace.as_str())
    }
}

impl<F, C, I> Pipeline for ListingPipeline<F, C, I>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
    I: Inference,
{
    type Params = ListingRequest;

    fn name(&self) -> &str {
        "listing"
    }

    fn validate(&self, request: &ListingRequest) -> Result<(), AppError> {
        let product_id = request.product_id.trim();
        if product_id.is_empty() {
            return Err(AppError::InvalidInput("product_id is required".into()));
        }
        if product_id.len() > 32 || !product_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidInput(format!(
                "product_id '{product_id}' must be 1-32 alphanumeric characters"
            )));
        }

        if !request.keywords.iter().any(|k| !k.keyword.trim().is_empty()) {
            return Err(AppError::InvalidInput(
                "at least one non-empty keyword is required".into(),
            ));
        }

        let marketplace = self.marketplace(request);
        let host_ok = marketplace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
            && Url::parse(&format!("https://{marketplace}/"))
                .ok()
                .and_then(|u| u.host_str().map(|h| h.contains('.')))
                .unwrap_or(false);
        if !host_ok {
            return Err(AppError::InvalidInput(format!(
                "marketplace '{marketplace}' is not a valid host"
            )));
        }

        Ok(())
    }

    async fn run<P: ProgressSink + 'static>(
        &self,
        job_id: Uuid,
        request: ListingRequest,
        progress: P,
    ) -> Result<serde_json::Value, AppError> {
        let product_id = request.product_id.trim().to_string();
        let url = listing_url(self.marketplace(&request), &product_id);

        progress.update(5, "Fetching listing page").await;
        let page = self.fetcher.fetch(&url).await?;

        progress.update(25, "Cleaning listing content").await;
        let markdown = self.cleaner.clean(&page.body)?;
        let content: Arc<str> = Arc::from(truncate_chars(&markdown, self.config.max_content_chars));

        let keywords: Vec<KeywordRow> = request
            .keywords
            .into_iter()
            .filter_map(|row| {
                let keyword = row.keyword.trim().to_string();
                (!keyword.is_empty()).then_some(KeywordRow {
                    keyword,
                    search_volume: row.search_volume,
                })
            })
            .collect();
        let requested = keywords.len();

        progress
            .update(35, &format!("Analyzing {requested} keywords"))
            .await;
        let inference = self.inference.clone();
        let listing = content.clone();
        let outcome = self
            .orchestrator
            .process_with_fallback(
                keywords,
                move |batch: Batch<KeywordRow>| {
                    let inference = inference.clone();
                    let listing = listing.clone();
                    async move { analyze_batch(&inference, &listing, batch).await }
                },
                |outputs: Vec<Vec<KeywordInsight>>| outputs.into_iter().flatten().collect::<Vec<_>>(),
                &self.config.keyword_batch,
            )
            .await?;

        if !outcome.is_complete() {
            tracing::warn!(
                %job_id,
                dropped = outcome.dropped_items,
                failed_batches = outcome.failed_batches.len(),
                "Keyword analysis is partial"
            );
        }

        progress.update(80, "Generating listing copy").await;
        let prompt = copy_prompt(
            &content,
            &outcome.aggregate[..outcome.aggregate.len().min(self.config.copy_keywords)],
        );
        let copy = run_with_retry(
            &self.limiter,
            &self.monitor,
            COPY_AGENT,
            &format!("{job_id}:copy"),
            |_| {
                let inference = self.inference.clone();
                let prompt = prompt.clone();
                async move { Attempt::from_result(inference.infer(&prompt).await) }
            },
        )
        .await?;

        progress.update(95, "Assembling results").await;
        let results = ListingResults {
            product_id,
            listing_url: url,
            scrape: ScrapeSummary {
                status: page.status,
                attempts: page.attempts,
            },
            keywords_requested: requested,
            keywords_analyzed: outcome.aggregate.len(),
            keywords_dropped: outcome.dropped_items,
            batches_total: outcome.total_batches,
            batches_failed: outcome.failed_batches.len(),
            partial: !outcome.is_complete(),
            keywords: outcome.aggregate,
            copy: copy.trim().to_string(),
        };

        Ok(serde_json::to_value(results)?)
    }
}

async fn analyze_batch<I: Inference>(
    inference: &I,
    listing: &str,
    batch: Batch<KeywordRow>,
) -> Result<Vec<KeywordInsight>, AppError> {
    let prompt = keyword_prompt(listing, &batch.items);
    let raw = inference.infer(&prompt).await?;
    let entries = parse_json_array(&raw)?;

    if entries.len() != batch.items.len() {
        return Err(AppError::InferenceError {
            message: format!(
                "batch {}: expected {} entries, got {}",
                batch.index,
                batch.items.len(),
                entries.len()
            ),
            status_code: 200,
            retryable: true,
        });
    }

    Ok(batch
        .items
        .into_iter()
        .zip(entries)
        .map(|(row, analysis)| KeywordInsight {
            keyword: row.keyword,
            search_volume: row.search_volume,
            analysis,
        })
        .collect())
}

fn keyword_prompt(listing: &str, rows: &[KeywordRow]) -> String {
    let list = rows
        .iter()
        .map(|row| match row.search_volume {
            Some(volume) => format!("- {} (search volume: {volume})", row.keyword),
            None => format!("- {}", row.keyword),
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Analyze how each keyword relates to the product listing below.\n\
         Return a JSON array with exactly {} objects, one per keyword, in the same order. \
         Each object must have \"keyword\" (string), \"relevance\" (integer 1-10) and \"category\" (string).\n\n\
         Keywords:\n{list}\n\nListing:\n{listing}",
        rows.len()
    )
}

fn copy_prompt(listing: &str, insights: &[KeywordInsight]) -> String {
    let keywords = insights
        .iter()
        .map(|i| i.keyword.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Write an improved product title and five bullet points for the listing below, \
         working in these keywords where they fit: {keywords}\n\nListing:\n{listing}"
    )
}

/// Pull the outermost JSON array out of a model reply, tolerating code
/// fences and surrounding prose.
fn parse_json_array(raw: &str) -> Result<Vec<serde_json::Value>, AppError> {
    let malformed = |detail: String| AppError::InferenceError {
        message: format!("malformed model output: {detail}"),
        status_code: 200,
        retryable: true,
    };

    let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']')) else {
        return Err(malformed("no JSON array found".into()));
    };
    if end < start {
        return Err(malformed("no JSON array found".into()));
    }

    serde_json::from_str(&raw[start..=end]).map_err(|e| malformed(e.to_string()))
}
