#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/heliodata/heliodata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for space-physics time-series providers.
//!
//! This crate provides the foundational abstractions shared by providers,
//! caches and the request planner:
//!
//! - [`TimeInterval`](interval::TimeInterval) - Half-open time ranges and gap arithmetic
//! - [`CanonicalSeries`](series::CanonicalSeries) - Normalized time-series data
//! - [`CoverageIndex`](coverage::CoverageIndex) - Cached ranges of one dataset
//! - [`SeriesProvider`](provider::SeriesProvider) - Remote archive adapters
//! - [`SeriesCache`](cache::SeriesCache) - Caching abstraction

/// Cache trait and entry model.
pub mod cache;
/// Coverage bookkeeping.
pub mod coverage;
/// Dataset identifiers.
pub mod dataset;
/// Error types for data operations.
pub mod error;
/// Time intervals and gap arithmetic.
pub mod interval;
/// Provider traits for fetching series.
pub mod provider;
/// The canonical series format.
pub mod series;

// Re-export commonly used items at crate root
pub use cache::{CacheEntry, RetentionPolicy, SeriesCache, WriteOutcome};
pub use coverage::CoverageIndex;
pub use dataset::DatasetId;
pub use error::{DataError, Result};
pub use interval::{TimeInterval, gap_subtract, merge_adjacent};
pub use provider::{DataProvider, SeriesProvider};
pub use series::{CanonicalSeries, SeriesMetadata};
