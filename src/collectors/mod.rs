//! Source collectors.
//!
//! Every external feed implements [`SourceCollector`]: log in, fetch the
//! pages for a date window, turn each page into [`RawRecord`]s. Which
//! implementation serves a source is decided by its configured
//! [`SourceKind`], never by its name.

pub mod form_portal;
pub mod payload;
pub mod token_api;

pub use form_portal::FormPortalCollector;
pub use payload::{PayloadFormat, RawPayload};
pub use token_api::TokenApiCollector;

use crate::config::{CollectionConfig, SourceConfig, SourceKind};
use crate::models::RawRecord;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::header::CONTENT_TYPE;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("account is locked")]
    Locked,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("request timed out")]
    Timeout,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("http error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for AuthFailure {
    fn from(err: reqwest::Error) -> Self {
        AuthFailure::Network(err.without_url().to_string())
    }
}

impl From<reqwest::Error> for FetchFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchFailure::Timeout
        } else {
            FetchFailure::Http(err.without_url().to_string())
        }
    }
}

/// Per-source knobs a collector needs besides its endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    pub name: String,
    pub ttl_days: u32,
    pub lookback_days: u32,
    pub page_size: u32,
    pub max_pages: u32,
}

impl SourceProfile {
    pub fn from_config(name: &str, config: &SourceConfig) -> Self {
        Self {
            name: name.to_string(),
            ttl_days: config.ttl_days,
            lookback_days: config.lookback_days,
            page_size: config.page_size,
            max_pages: config.max_pages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub auth: Duration,
    pub fetch: Duration,
}

impl From<&CollectionConfig> for HttpTimeouts {
    fn from(config: &CollectionConfig) -> Self {
        Self {
            auth: config.auth_timeout(),
            fetch: config.fetch_timeout(),
        }
    }
}

/// An authenticated session. Owns the HTTP client (and with it the cookie
/// jar) so that nothing leaks from one run into the next.
#[derive(Clone)]
pub struct Session {
    client: reqwest::Client,
    token: Option<String>,
}

impl Session {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Inclusive window of detection dates to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// `[now - days, now]`
    pub fn lookback(now: DateTime<Utc>, days: u32) -> Self {
        let end = now.date_naive();
        Self {
            start: end - ChronoDuration::days(i64::from(days)),
            end,
        }
    }
}

/// Records parsed from the pages fetched in one run. `interrupted` is set
/// when fetching stopped early after at least one good page.
#[derive(Debug, Default)]
pub struct RawBatch {
    pub records: Vec<RawRecord>,
    pub pages: u32,
    pub interrupted: Option<FetchFailure>,
}

impl RawBatch {
    pub fn is_partial(&self) -> bool {
        self.interrupted.is_some()
    }
}

#[async_trait]
pub trait SourceCollector: Send + Sync {
    fn profile(&self) -> &SourceProfile;

    fn name(&self) -> &str {
        &self.profile().name
    }

    /// Log in once. Callers decide whether a failure is worth one retry.
    async fn authenticate(&self) -> Result<Session, AuthFailure>;

    /// Fetch every page of records detected within `range`, parsing each
    /// page with [`SourceCollector::parse_records`] as it arrives.
    async fn fetch_raw_batch(
        &self,
        session: &Session,
        range: &DateRange,
    ) -> Result<RawBatch, FetchFailure>;

    fn parse_records(&self, payload: &RawPayload) -> Result<Vec<RawRecord>, FetchFailure> {
        payload::parse(payload)
    }
}

/// Build the collector for a configured source.
pub fn build_collector(
    name: &str,
    source: &SourceConfig,
    collection: &CollectionConfig,
) -> Arc<dyn SourceCollector> {
    let profile = SourceProfile::from_config(name, source);
    let timeouts = HttpTimeouts::from(collection);

    match source.kind {
        SourceKind::FormPortal => Arc::new(FormPortalCollector::new(
            profile,
            &source.base_url,
            source.credentials.clone(),
            timeouts,
        )),
        SourceKind::TokenApi => Arc::new(TokenApiCollector::new(
            profile,
            &source.base_url,
            source.credentials.clone(),
            timeouts,
        )),
    }
}

/// Fresh client for one session.
pub(crate) fn session_client(timeouts: &HttpTimeouts) -> Result<reqwest::Client, AuthFailure> {
    reqwest::Client::builder()
        .cookie_store(true)
        .connect_timeout(timeouts.auth)
        .timeout(timeouts.fetch)
        .user_agent(concat!("blackwall/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AuthFailure::Network(format!("failed to build HTTP client: {e}")))
}

/// Send a page request and capture the body with its declared format.
pub(crate) async fn read_page(
    request: reqwest::RequestBuilder,
    page: u32,
) -> Result<RawPayload, FetchFailure> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchFailure::Http(format!("page {page} returned HTTP {status}")));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;

    Ok(RawPayload::detect(content_type.as_deref(), page, body))
}

/// Request pages until one comes back short or `max_pages` is reached.
/// Each page is parsed once; its row count decides whether to go on.
///
/// A failure on the first page fails the fetch. A failure on a later page
/// keeps what was already fetched and marks the batch interrupted.
pub(crate) async fn collect_pages<F, Fut, P>(
    profile: &SourceProfile,
    mut fetch_page: F,
    parse: P,
) -> Result<RawBatch, FetchFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<RawPayload, FetchFailure>>,
    P: Fn(&RawPayload) -> Result<Vec<RawRecord>, FetchFailure>,
{
    let mut batch = RawBatch::default();

    for page in 1..=profile.max_pages {
        let outcome = match fetch_page(page).await {
            Ok(payload) => parse(&payload),
            Err(err) => Err(err),
        };

        let records = match outcome {
            Ok(records) => records,
            Err(err) if batch.pages == 0 => return Err(err),
            Err(err) => {
                warn!(source = %profile.name, page, error = %err, "Fetch interrupted, keeping earlier pages");
                batch.interrupted = Some(err);
                break;
            }
        };

        let rows = records.len();
        debug!(source = %profile.name, page, rows, "Fetched page");
        batch.pages += 1;
        batch.records.extend(records);

        if rows < profile.page_size as usize {
            break;
        }
    }

    Ok(batch)
}
