//! Feed fetching + store primitives for the NAV pipeline.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use navsync_core::{
    AmfiCategory, AmfiCategorySummary, CategoryStatus, FundSnapshot, FundUpsert, Page, PageQuery,
    StoredFund,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "navsync-storage";

pub const DEFAULT_FEED_URL: &str = "https://www.amfiindia.com/spages/NAVAll.txt";

/// Raw feed text plus when it was fetched; the unit the feed cache holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub digest: String,
}

impl FeedSnapshot {
    pub fn new(body: String, fetched_at: DateTime<Utc>) -> Self {
        let digest = sha256_hex(body.as_bytes());
        Self {
            body,
            fetched_at,
            digest,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0".to_string(),
            accept: "text/plain".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&config.accept).context("invalid Accept header value")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    /// Single GET, no internal retry: a failed fetch fails the run and the
    /// scheduler tries again on its next tick.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| self.request_error(url, err))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(status_error(status, resp.url().as_str()));
            }

            let body = resp.text().await.map_err(|err| self.request_error(url, err))?;
            debug!(bytes = body.len(), "feed body received");
            Ok(body)
        }
        .instrument(span)
        .await
    }

    fn request_error(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

fn status_error(status: StatusCode, url: &str) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

/// Where the pipeline gets a fresh snapshot from when its cache is stale.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_feed(&self) -> Result<FeedSnapshot, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    http: HttpFetcher,
    url: String,
}

impl HttpFeedSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_feed(&self) -> Result<FeedSnapshot, FetchError> {
        let body = self.http.fetch_text(&self.url).await?;
        Ok(FeedSnapshot::new(body, Utc::now()))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("bulk write failed for {failed} of {attempted} operations; first error: {first}")]
    BulkWrite {
        failed: usize,
        attempted: usize,
        first: String,
    },
    #[error("invalid stored value: {0}")]
    InvalidData(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of inserting a category whose name carries a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryInsert {
    Created(Uuid),
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub modified: usize,
}

/// Write-side primitives the ingestion pipeline needs.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn find_category_by_name(&self, name: &str) -> Result<Option<AmfiCategory>, StoreError>;

    async fn insert_category(&self, category: &AmfiCategory) -> Result<CategoryInsert, StoreError>;

    /// Projection of `nav`, `nav_date` and category for exactly the given ISINs.
    async fn find_fund_snapshots(&self, isins: &[String]) -> Result<Vec<FundSnapshot>, StoreError>;

    /// Unordered bulk upsert: every op is attempted even if a sibling fails.
    async fn bulk_write(&self, ops: &[FundUpsert]) -> Result<BulkWriteResult, StoreError>;
}

/// Read-side primitives behind the query API.
#[async_trait]
pub trait QueryStore: Send + Sync {
    async fn list_funds(&self, query: &PageQuery) -> Result<Page<StoredFund>, StoreError>;

    async fn count_funds(&self) -> Result<u64, StoreError>;

    async fn list_categories(
        &self,
        query: &PageQuery,
    ) -> Result<Page<AmfiCategorySummary>, StoreError>;

    async fn get_category(&self, id: Uuid) -> Result<Option<AmfiCategory>, StoreError>;

    async fn update_category_status(
        &self,
        id: Uuid,
        status: CategoryStatus,
    ) -> Result<Option<AmfiCategory>, StoreError>;

    /// Links an instrument category and marks the AMFI category `set`.
    async fn link_instrument_category(
        &self,
        id: Uuid,
        instrument_category: Uuid,
    ) -> Result<Option<AmfiCategory>, StoreError>;
}

/// `%term%` with LIKE metacharacters escaped so search text matches literally.
pub fn like_pattern(search: &str) -> String {
    let mut out = String::with_capacity(search.len() + 2);
    out.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}
