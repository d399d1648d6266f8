use std::net::IpAddr;
use std::time::Duration;

use keel_core::error::AppError;
use keel_core::traits::{FetchRequest, Fetcher, RawResponse};
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, REFERER, USER_AGENT};
use url::Url;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// HTTP page fetcher using reqwest.
///
/// Sends the identity carried by each [`FetchRequest`] as browser headers and
/// returns every response, error statuses included, so the resilience layer
/// can classify it. Requests to private or reserved addresses are refused
/// unless [`allow_private_urls`](Self::allow_private_urls) is set.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    /// Disable the private-address check (local testing only).
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, AppError> {
        if self.ssrf_protection {
            ensure_public(&request.url).await?;
        }

        let mut builder = self
            .client
            .get(&request.url)
            .header(USER_AGENT, &request.user_agent)
            .header(ACCEPT_LANGUAGE, &request.accept_language)
            .header(ACCEPT, ACCEPT_HTML);
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        tracing::debug!(url = %request.url, status, bytes = body.len(), "Fetched page");
        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

impl ReqwestFetcher {
    fn map_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else if e.is_body() || e.is_decode() {
            AppError::NetworkError(format!("Failed to read response body: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Refuse non-http(s) URLs and hosts that resolve to private addresses.
async fn ensure_public(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::InvalidInput(format!("Invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::InvalidInput(format!(
            "URL scheme '{}' is not allowed (only http/https)",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidInput("URL has no host".to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let addresses: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            let port = parsed.port_or_known_default().unwrap_or(80);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
                .map(|addr| addr.ip())
                .collect()
        }
    };

    if addresses.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }
    if let Some(ip) = addresses.into_iter().find(|ip| is_private_ip(*ip)) {
        return Err(AppError::InvalidInput(format!(
            "Refusing to fetch {host}: resolves to private/reserved address {ip}"
        )));
    }
    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // 100.64.0.0/10
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
