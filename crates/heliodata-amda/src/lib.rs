#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/heliodata/heliodata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! AMDA data provider.
//!
//! This crate provides an AMDA provider that implements the
//! [`DataProvider`] and [`SeriesProvider`] traits from `heliodata-core`.
//!
//! # Features
//!
//! - Token-based access to the AMDA REST interface
//! - User parameters when credentials are configured
//! - Built-in rate limiting (1 request per second by default)
//! - Parsing of AMDA ASCII data files, header metadata included
//!
//! # Example
//!
//! ```no_run
//! use heliodata_amda::AmdaProvider;
//! use heliodata_core::{DatasetId, SeriesProvider, TimeInterval};
//!
//! # async fn example() -> heliodata_core::Result<()> {
//! let provider = AmdaProvider::new()?;
//! let dataset = DatasetId::new("amda", "imf");
//! let interval = TimeInterval::from_unix_seconds(1_577_836_800, 1_577_840_400)?;
//!
//! let series = provider.fetch(&dataset, &interval).await?;
//! println!("Fetched {} samples", series.len());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use heliodata_core::{
    CanonicalSeries, DataError, DataProvider, DatasetId, Result, SeriesMetadata, SeriesProvider,
    TimeInterval,
};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, instrument, warn};

/// Default AMDA server.
pub const DEFAULT_SERVER_URL: &str = "http://amda.irap.omp.eu";

/// Registry name of this provider.
const PROVIDER_NAME: &str = "amda";

/// Default spacing between two requests.
const DEFAULT_RATE_LIMIT: Duration = Duration::from_secs(1);

/// Default HTTP timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay assumed when a throttling response carries no `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// AMDA answers with this Cloudflare status when it sheds load.
const ORIGIN_UNREACHABLE: u16 = 523;

/// User agent for HTTP requests.
const USER_AGENT: &str = concat!("heliodata/", env!("CARGO_PKG_VERSION"));

/// Rate limiter keeping a minimum spacing between requests.
#[derive(Debug)]
struct RateLimiter {
    last_request: Instant,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            last_request: now.checked_sub(min_interval).unwrap_or(now),
            min_interval,
        }
    }

    async fn wait(&mut self) {
        let elapsed = self.last_request.elapsed();
        if elapsed < self.min_interval {
            let wait_time = self.min_interval - elapsed;
            debug!("Rate limiting: waiting {:?}", wait_time);
            sleep(wait_time).await;
        }
        self.last_request = Instant::now();
    }
}

/// Connection settings for [`AmdaProvider`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmdaConfig {
    /// Server base URL.
    pub server_url: String,
    /// Account name, required for user parameters.
    pub username: Option<String>,
    /// Account password.
    pub password: Option<String>,
    /// Minimum spacing between two requests.
    pub rate_limit: Duration,
    /// HTTP timeout of a single request.
    pub timeout: Duration,
}

impl Default for AmdaConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            username: None,
            password: None,
            rate_limit: DEFAULT_RATE_LIMIT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Debug for AmdaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmdaConfig")
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("rate_limit", &self.rate_limit)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AmdaConfig {
    /// Reads `HELIODATA_AMDA_URL`, `HELIODATA_AMDA_USERNAME` and
    /// `HELIODATA_AMDA_PASSWORD`, keeping defaults for unset variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            server_url: lookup("HELIODATA_AMDA_URL")
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.server_url),
            username: lookup("HELIODATA_AMDA_USERNAME").filter(|u| !u.is_empty()),
            password: lookup("HELIODATA_AMDA_PASSWORD").filter(|p| !p.is_empty()),
            ..defaults
        }
    }

    /// Sets the server base URL.
    #[must_use]
    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    /// Sets the account used for user parameters.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the minimum spacing between requests.
    #[must_use]
    pub const fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref()?))
    }
}

/// AMDA data provider.
///
/// Implements [`DataProvider`] and [`SeriesProvider`]. The dataset path is
/// the AMDA parameter id.
#[derive(Debug)]
pub struct AmdaProvider {
    client: reqwest::Client,
    config: AmdaConfig,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl AmdaProvider {
    /// Create a new AMDA provider with default settings.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_config(AmdaConfig::default())
    }

    /// Create a new AMDA provider with the given settings.
    ///
    /// # Errors
    /// Returns an error if the server URL is invalid or the HTTP client
    /// cannot be built.
    pub fn with_config(config: AmdaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| DataError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Self::with_client(client, config)
    }

    /// Create a new AMDA provider with a custom HTTP client.
    ///
    /// Rate limiting is still applied.
    ///
    /// # Errors
    /// Returns an error if the server URL is invalid.
    pub fn with_client(client: reqwest::Client, config: AmdaConfig) -> Result<Self> {
        Url::parse(&config.server_url).map_err(|e| {
            DataError::InvalidParameter(format!("Invalid AMDA URL {}: {}", config.server_url, e))
        })?;
        Ok(Self {
            client,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(config.rate_limit))),
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &AmdaConfig {
        &self.config
    }

    fn endpoint(&self, script: &str) -> Result<Url> {
        let base = self.config.server_url.trim_end_matches('/');
        Url::parse(&format!("{base}/php/rest/{script}"))
            .map_err(|e| DataError::InvalidParameter(e.to_string()))
    }

    /// Build the `getParameter.php` URL for one parameter and interval.
    fn parameter_url(
        &self,
        parameter: &str,
        interval: &TimeInterval,
        token: &str,
    ) -> Result<Url> {
        let mut url = self.endpoint("getParameter.php")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("startTime", &unix_seconds(interval.start()))
                .append_pair("stopTime", &unix_seconds(interval.end()))
                .append_pair("parameterID", parameter)
                .append_pair("timeFormat", "UNIXTIME");
            if let Some((username, password)) = self.config.credentials() {
                query
                    .append_pair("userID", username)
                    .append_pair("password", password);
            }
            query.append_pair("token", token);
        }
        Ok(url)
    }

    /// Send a rate-limited GET and map error statuses.
    async fn get(&self, url: Url, context: &str) -> Result<reqwest::Response> {
        self.rate_limiter.lock().await.wait().await;

        // The query carries the token and credentials
        debug!("GET {}", url.path());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DataError::Unavailable(e.without_url().to_string()))?;

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok());
        if let Some(err) = status_error(response.status(), retry_after, context) {
            warn!("AMDA request for {} failed: {}", context, err);
            return Err(err);
        }
        Ok(response)
    }

    /// Fetch a session token from `auth.php`.
    async fn token(&self) -> Result<String> {
        let response = self.get(self.endpoint("auth.php")?, "token").await?;
        let token = response
            .text()
            .await
            .map_err(|e| DataError::Unavailable(e.without_url().to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(DataError::Unavailable("AMDA returned an empty token".to_string()));
        }
        Ok(token.to_string())
    }
}

impl DataProvider for AmdaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn description(&self) -> &str {
        "AMDA space-physics archive (CDPP, IRAP)"
    }
}

#[async_trait]
impl SeriesProvider for AmdaProvider {
    #[instrument(skip(self), fields(dataset = %dataset, interval = %interval))]
    async fn fetch(
        &self,
        dataset: &DatasetId,
        interval: &TimeInterval,
    ) -> Result<CanonicalSeries> {
        if dataset.provider() != PROVIDER_NAME {
            return Err(DataError::InvalidParameter(format!(
                "{} is not an AMDA dataset",
                dataset
            )));
        }
        let parameter = dataset.path();

        let token = self.token().await?;
        let url = self.parameter_url(parameter, interval, &token)?;
        let envelope: ParameterResponse = self
            .get(url, parameter)
            .await?
            .json()
            .await
            .map_err(|e| DataError::Parse(e.without_url().to_string()))?;

        let mut fragments = Vec::new();
        for file_url in envelope.into_data_files(parameter)? {
            let file_url = Url::parse(&file_url)
                .map_err(|e| DataError::Parse(format!("Bad data file URL {}: {}", file_url, e)))?;
            let text = self
                .get(file_url, parameter)
                .await?
                .text()
                .await
                .map_err(|e| DataError::Unavailable(e.without_url().to_string()))?;
            fragments.push(parse_ascii(parameter, &text)?);
        }

        let series = CanonicalSeries::concat_all(fragments)?.slice(interval);
        debug!("Fetched {} samples of {}", series.len(), parameter);
        Ok(series)
    }
}

/// Maps an HTTP status to the provider error contract.
fn status_error(status: StatusCode, retry_after: Option<&str>, context: &str) -> Option<DataError> {
    if status.is_success() {
        return None;
    }
    let err = if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == ORIGIN_UNREACHABLE {
        DataError::RateLimited {
            provider: PROVIDER_NAME.to_string(),
            retry_after: Some(
                retry_after
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs),
            ),
        }
    } else if status == StatusCode::NOT_FOUND {
        DataError::NotFound(context.to_string())
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        DataError::Unavailable(format!("HTTP {} for {}", status, context))
    } else {
        DataError::Other(format!("HTTP {} for {}", status, context))
    };
    Some(err)
}

/// Formats an instant as UNIX seconds, with a fractional part only when needed.
fn unix_seconds(at: DateTime<Utc>) -> String {
    let micros = at.timestamp_micros();
    if micros % 1_000_000 == 0 {
        return (micros / 1_000_000).to_string();
    }
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    format!("{sign}{}.{:06}", abs / 1_000_000, abs % 1_000_000)
}

/// Parses a data-file time column: UNIX seconds, or ISO 8601 as a fallback.
fn parse_time(token: &str) -> Option<DateTime<Utc>> {
    if let Some(at) = parse_unix_seconds(token) {
        return Some(at);
    }
    if let Ok(at) = token.parse::<DateTime<Utc>>() {
        return Some(at);
    }
    NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parses decimal UNIX seconds without going through `f64`, so that
/// nanosecond digits survive.
fn parse_unix_seconds(token: &str) -> Option<DateTime<Utc>> {
    let (whole, fraction) = token.split_once('.').unwrap_or((token, ""));
    if whole.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = whole.parse().ok()?;
    let digits: String = fraction.chars().take(9).collect();
    let nanos: u32 = if digits.is_empty() {
        0
    } else {
        format!("{digits:0<9}").parse().ok()?
    };
    if whole.starts_with('-') && nanos > 0 {
        DateTime::from_timestamp(secs - 1, 1_000_000_000 - nanos)
    } else {
        DateTime::from_timestamp(secs, nanos)
    }
}

/// Parse an AMDA ASCII data file.
///
/// Lines starting with `#` are `KEY : value` header entries; the data
/// columns, units and fill value are picked from them and the rest are
/// kept as attributes. Data rows are whitespace-separated with the time
/// first.
fn parse_ascii(parameter: &str, text: &str) -> Result<CanonicalSeries> {
    let mut metadata = SeriesMetadata::default();
    let mut rows = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('#') {
            if let Some((key, value)) = header.split_once(':') {
                read_header(&mut metadata, key.trim(), value.trim().trim_end_matches(';').trim());
            }
            continue;
        }

        let mut fields = line.split_whitespace();
        let time = fields.next().unwrap_or_default();
        let at = parse_time(time).ok_or_else(|| {
            DataError::Parse(format!("line {}: invalid time {:?}", number + 1, time))
        })?;
        let values = fields
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    DataError::Parse(format!("line {}: invalid value {:?}: {}", number + 1, field, e))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push((at, values));
    }

    let arity = rows.first().map_or(metadata.columns.len(), |(_, values)| values.len());
    if metadata.columns.len() != arity {
        metadata.columns = match arity {
            1 => vec![parameter.to_string()],
            _ => (0..arity).map(|i| format!("{parameter}[{i}]")).collect(),
        };
    }

    CanonicalSeries::from_rows(metadata, rows)
}

fn read_header(metadata: &mut SeriesMetadata, key: &str, value: &str) {
    let upper = key.to_ascii_uppercase();
    if upper.contains("COLUMNS") {
        metadata.columns = value
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
            .filter(|column| !column.to_ascii_uppercase().contains("TIME"))
            .map(str::to_string)
            .collect();
    } else if upper.contains("UNITS") {
        if !value.is_empty() {
            metadata.units = Some(value.to_string());
        }
    } else if upper.contains("FILL_VALUE") || upper.contains("FILLVAL") {
        metadata.fill_value = value.parse().ok();
    } else if !key.is_empty() {
        metadata.attributes.insert(key.to_string(), value.to_string());
    }
}

// ============================================================================
// AMDA API Response Types
// ============================================================================

/// `getParameter.php` response.
#[derive(Debug, Deserialize)]
struct ParameterResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "dataFileURLs", default)]
    data_file_urls: Option<DataFileUrls>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DataFileUrls {
    One(String),
    Many(Vec<String>),
}

impl ParameterResponse {
    /// The data files to download.
    ///
    /// AMDA answers `success: false` for transient server-side failures as
    /// well, so it is reported as unavailable and retried. A successful
    /// answer listing no files is a confirmed absence of data.
    fn into_data_files(self, parameter: &str) -> Result<Vec<String>> {
        if !self.success {
            return Err(DataError::Unavailable(format!(
                "AMDA could not serve {}: {}",
                parameter,
                self.message.as_deref().unwrap_or("no reason given")
            )));
        }
        match self.data_file_urls {
            Some(DataFileUrls::One(url)) => Ok(vec![url]),
            Some(DataFileUrls::Many(urls)) => Ok(urls),
            None => Err(DataError::Parse(format!(
                "AMDA response for {} has no dataFileURLs",
                parameter
            ))),
        }
    }
}
