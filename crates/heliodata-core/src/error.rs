//! Error types for data operations.
//!
//! This module defines [`DataError`] which covers all error cases that can occur
//! when fetching, parsing, caching or merging time-series data.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during data operations.
#[derive(Error, Debug)]
pub enum DataError {
    /// An interval was built with `start >= end`.
    #[error("Invalid interval: start {start} is not before end {end}")]
    InvalidInterval {
        /// Requested start.
        start: String,
        /// Requested end.
        end: String,
    },

    /// A cache read asked for a range that is not fully covered.
    ///
    /// This signals a planner bug, never a condition callers should handle.
    #[error("Uncovered read of {dataset} over {interval}")]
    UncoveredRead {
        /// Dataset that was read.
        dataset: String,
        /// Interval that was not covered.
        interval: String,
    },

    /// Fragments with different field arity were combined.
    #[error("Schema mismatch: expected {expected} fields, found {found}")]
    SchemaMismatch {
        /// Arity of the left-hand fragment.
        expected: usize,
        /// Arity of the offending fragment.
        found: usize,
    },

    /// Fragments were concatenated out of timestamp order.
    #[error("Unordered concat: {left_last} is not before {right_first}")]
    UnorderedConcat {
        /// Last timestamp of the left fragment.
        left_last: String,
        /// First timestamp of the right fragment.
        right_first: String,
    },

    /// The provider has no data for the dataset or interval.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or service failure.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Rate limit exceeded by a provider.
    #[error("Rate limited by {provider}: retry after {retry_after:?}")]
    RateLimited {
        /// The provider that rate limited the request.
        provider: String,
        /// Suggested time to wait before retrying.
        retry_after: Option<Duration>,
    },

    /// Error parsing data from a provider.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Error interacting with the cache.
    #[error("Cache error: {0}")]
    Cache(String),

    /// The requested provider is not configured.
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The request was cancelled before this operation ran.
    #[error("Cancelled")]
    Cancelled,

    /// A sub-interval failed while the request ran in fail-fast mode.
    #[error("Fetch of {interval} failed: {source}")]
    FetchFailed {
        /// The sub-interval that could not be retrieved.
        interval: String,
        /// The error that ended the last attempt.
        #[source]
        source: Box<DataError>,
    },

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl DataError {
    /// Returns true for transient failures the planner should retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited { .. })
    }

    /// Returns the provider-specified backoff, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias using [`DataError`].
pub type Result<T> = std::result::Result<T, DataError>;
