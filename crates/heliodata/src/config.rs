//! Per-request planner settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use heliodata_core::{DataError, Result};

/// Settings for one [`RequestPlanner::get`](crate::RequestPlanner::get) call.
///
/// The defaults are best-effort: failed sub-intervals are reported in
/// [`Retrieved::failed`](crate::Retrieved::failed) instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Upper bound on concurrent provider fetches of one request.
    pub max_parallel_fetches: usize,
    /// Retries after the first attempt for `Unavailable` and `RateLimited`.
    pub retry_limit: u32,
    /// Abort on the first unrecoverable sub-interval failure.
    pub fail_fast: bool,
    /// Evict cache entries older than this before planning.
    pub cache_ttl: Option<Duration>,
    /// Time limit of a single provider call.
    pub fetch_timeout: Option<Duration>,
    /// Delay before the first retry; doubled on each further one.
    pub backoff_base: Duration,
    /// Ceiling of the computed backoff.
    pub backoff_max: Duration,
    /// Split fetches at epoch-aligned multiples of this duration.
    pub fragment_duration: Option<Duration>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_parallel_fetches: 4,
            retry_limit: 3,
            fail_fast: false,
            cache_ttl: None,
            fetch_timeout: Some(Duration::from_secs(120)),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            fragment_duration: None,
        }
    }
}

impl RequestConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fetch concurrency bound.
    #[must_use]
    pub const fn with_max_parallel_fetches(mut self, max: usize) -> Self {
        self.max_parallel_fetches = max;
        self
    }

    /// Sets the number of retries.
    #[must_use]
    pub const fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Enables or disables fail-fast mode.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Sets the cache time-to-live.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Sets or removes the per-fetch timeout.
    #[must_use]
    pub const fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the exponential backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Sets the fragment duration used to split fetches.
    #[must_use]
    pub const fn with_fragment_duration(mut self, duration: Duration) -> Self {
        self.fragment_duration = Some(duration);
        self
    }

    /// Checks the settings for values the planner cannot honor.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidParameter`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_fetches == 0 {
            return Err(DataError::InvalidParameter(
                "max_parallel_fetches must be at least 1".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(DataError::InvalidParameter(format!(
                "backoff_base {:?} exceeds backoff_max {:?}",
                self.backoff_base, self.backoff_max
            )));
        }
        if self.fetch_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DataError::InvalidParameter(
                "fetch_timeout must be positive".to_string(),
            ));
        }
        if self.fragment_duration.is_some_and(|d| d.is_zero()) {
            return Err(DataError::InvalidParameter(
                "fragment_duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
