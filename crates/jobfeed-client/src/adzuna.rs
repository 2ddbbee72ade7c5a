use std::time::Duration;

use chrono::{DateTime, Utc};
use jobfeed_core::error::AppError;
use jobfeed_core::models::{JobRecord, SearchPage};
use jobfeed_core::traits::JobSource;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.adzuna.com/v1/api/jobs";
pub const MAX_RESULTS_PER_PAGE: u32 = 50;

/// Connection settings for the Adzuna search API.
#[derive(Clone)]
pub struct AdzunaConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_key: String,
    /// Two-letter country code used in the request path, e.g. `gb`.
    pub country: String,
    pub results_per_page: u32,
    pub timeout: Duration,
}

impl AdzunaConfig {
    pub fn new(app_id: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            app_id: app_id.into(),
            app_key: app_key.into(),
            country: "gb".to_string(),
            results_per_page: 20,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    pub fn with_results_per_page(mut self, results_per_page: u32) -> Self {
        self.results_per_page = results_per_page;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| AppError::ConfigError(format!("invalid API URL '{}': {e}", self.base_url)))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::ConfigError(format!(
                    "API URL scheme '{scheme}' is not allowed (only http/https)"
                )));
            }
        }
        if url.cannot_be_a_base() {
            return Err(AppError::ConfigError(format!(
                "API URL '{}' cannot be used as a base",
                self.base_url
            )));
        }
        if self.app_id.trim().is_empty() || self.app_key.trim().is_empty() {
            return Err(AppError::ConfigError(
                "app id and app key are both required".into(),
            ));
        }
        if self.country.is_empty() || !self.country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::ConfigError(format!(
                "invalid country code '{}'",
                self.country
            )));
        }
        if !(1..=MAX_RESULTS_PER_PAGE).contains(&self.results_per_page) {
            return Err(AppError::ConfigError(format!(
                "results per page must be between 1 and {MAX_RESULTS_PER_PAGE}, got {}",
                self.results_per_page
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AdzunaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdzunaConfig")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .field("app_key", &"<redacted>")
            .field("country", &self.country)
            .field("results_per_page", &self.results_per_page)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Search response body. Unknown top-level fields are ignored.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    count: Option<u64>,
    results: Vec<Map<String, Value>>,
}

/// [`JobSource`] backed by the Adzuna REST API.
#[derive(Clone, Debug)]
pub struct AdzunaSource {
    client: Client,
    config: AdzunaConfig,
}

impl AdzunaSource {
    pub fn new(config: AdzunaConfig) -> Result<Self, AppError> {
        config.validate()?;
        let client = Client::builder()
            .user_agent(concat!("jobfeed/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AdzunaConfig {
        &self.config
    }

    fn search_url(&self, query: &str, page: u32) -> Result<Url, AppError> {
        build_search_url(&self.config, query, page)
    }
}

impl JobSource for AdzunaSource {
    async fn fetch(&self, query: &str, page: u32) -> Result<SearchPage, AppError> {
        let url = self.search_url(query, page)?;
        tracing::debug!(page, %query, country = %self.config.country, "Requesting search page");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.config.timeout.as_secs())
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();
        if let Some(error) = status_error(status, response.headers().get(RETRY_AFTER)) {
            return Err(error);
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.config.timeout.as_secs())
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        })?;

        let parsed: SearchResponse = serde_json::from_slice(&body)
            .map_err(|e| AppError::MalformedResponse(format!("page {page}: {e}")))?;

        let received = parsed.results.len();
        let more = has_more(page, self.config.results_per_page, parsed.count, received);
        let records = parse_results(parsed.results, Utc::now());
        if records.len() < received {
            tracing::warn!(
                page,
                received,
                kept = records.len(),
                "Dropped search results without a usable id"
            );
        }

        Ok(SearchPage::new(records, more).with_received(received))
    }
}

/// `{base}/{country}/search/{page}?app_id=..&app_key=..&results_per_page=..&what=..`
fn build_search_url(config: &AdzunaConfig, query: &str, page: u32) -> Result<Url, AppError> {
    if page == 0 {
        return Err(AppError::ConfigError("search pages start at 1".into()));
    }
    let page = page.to_string();
    let mut url = Url::parse(&config.base_url)
        .map_err(|e| AppError::ConfigError(format!("invalid API URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| AppError::ConfigError("API URL cannot be used as a base".into()))?
        .pop_if_empty()
        .extend([config.country.as_str(), "search", page.as_str()]);
    url.query_pairs_mut()
        .append_pair("app_id", &config.app_id)
        .append_pair("app_key", &config.app_key)
        .append_pair("results_per_page", &config.results_per_page.to_string())
        .append_pair("what", query)
        .append_pair("content-type", "application/json");
    Ok(url)
}

/// Map a non-success status to the error the poller acts on.
fn status_error(status: StatusCode, retry_after: Option<&HeaderValue>) -> Option<AppError> {
    if status.is_success() {
        return None;
    }
    let error = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AppError::AuthError(format!("search API answered HTTP {}", status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimitExceeded {
            retry_after: retry_after.and_then(parse_retry_after),
        },
        s if s.is_server_error() => {
            AppError::NetworkError(format!("search API answered HTTP {}", s.as_u16()))
        }
        s => AppError::MalformedResponse(format!("unexpected HTTP {}", s.as_u16())),
    };
    Some(error)
}

/// Only the delta-seconds form is honoured.
fn parse_retry_after(value: &HeaderValue) -> Option<Duration> {
    value
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn has_more(page: u32, results_per_page: u32, count: Option<u64>, received: usize) -> bool {
    match count {
        Some(count) => u64::from(page) * u64::from(results_per_page) < count,
        None => received == results_per_page as usize,
    }
}

/// Turn raw results into records, dropping those without a usable id.
fn parse_results(results: Vec<Map<String, Value>>, fetched_at: DateTime<Utc>) -> Vec<JobRecord> {
    results
        .into_iter()
        .filter_map(|mut fields| {
            let id = match fields.remove("id") {
                Some(Value::String(s)) => s,
                Some(Value::Number(n)) => n.to_string(),
                other => {
                    tracing::warn!(id = ?other, "Search result has no usable id, skipping");
                    return None;
                }
            };
            let title = match fields.remove("title") {
                Some(Value::String(s)) => s,
                _ => String::new(),
            };
            match JobRecord::new(id, title, fields, fetched_at) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid search result, skipping");
                    None
                }
            }
        })
        .collect()
}
