//! Provider traits for fetching time-series data.
//!
//! This module defines the core provider traits:
//!
//! - [`DataProvider`] - Base trait for all data providers
//! - [`SeriesProvider`] - Time-series retrieval over an interval

use async_trait::async_trait;
use std::fmt::Debug;

use crate::{dataset::DatasetId, error::Result, interval::TimeInterval, series::CanonicalSeries};

/// Base trait for all data providers.
///
/// All data providers must implement this trait to provide basic metadata
/// about the provider.
pub trait DataProvider: Send + Sync + Debug {
    /// Returns the registry name of this provider (e.g., "amda").
    ///
    /// Dataset ids are routed to the provider whose name matches
    /// [`DatasetId::provider`].
    fn name(&self) -> &str;

    /// Returns a description of this provider.
    fn description(&self) -> &str;
}

/// Provider for time-series data.
///
/// Implementations fetch one interval of one dataset from a remote archive
/// and parse the native response into a [`CanonicalSeries`]. They must be
/// safe to call concurrently for disjoint intervals.
#[async_trait]
pub trait SeriesProvider: DataProvider {
    /// Fetches the samples of `dataset` within `interval`.
    ///
    /// Errors follow the planner's contract:
    ///
    /// - `NotFound` means the archive has no data; it is cached as
    ///   confirmed-empty. Returning an empty series is equivalent.
    /// - `Unavailable` and `RateLimited` are retried with backoff.
    /// - `Parse` is reported without retrying.
    async fn fetch(&self, dataset: &DatasetId, interval: &TimeInterval)
    -> Result<CanonicalSeries>;

    /// Returns the current version of `dataset`, if the archive publishes one.
    ///
    /// Cached fragments fetched at another version are dropped and fetched
    /// again. The default reports no version, which keeps cached data until
    /// it is evicted.
    async fn version(&self, _dataset: &DatasetId) -> Result<Option<String>> {
        Ok(None)
    }
}
