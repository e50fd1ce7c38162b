#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/heliodata/heliodata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Unified, cached access to space-physics time-series archives.
//!
//! This crate re-exports the core types, cache stores and provider
//! adapters, and provides the [`RequestPlanner`] that serves
//! `(dataset, interval)` requests from the cache, fetching only what is
//! missing from the providers in a [`ProviderRegistry`].
//!
//! # Features
//!
//! - `amda` - AMDA web-service provider
//! - `cache-sqlite` - SQLite-based caching
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use heliodata::{AmdaConfig, InMemoryCache, ProviderRegistry, RequestConfig, RequestPlanner};
//!
//! #[tokio::main]
//! async fn main() -> heliodata::Result<()> {
//!     let registry = ProviderRegistry::new().with_amda(AmdaConfig::from_env())?;
//!     let planner = RequestPlanner::new(Arc::new(registry), Arc::new(InMemoryCache::new()));
//!
//!     let dataset = "amda/imf".parse()?;
//!     let interval = heliodata::TimeInterval::from_unix_seconds(1_577_836_800, 1_577_923_200)?;
//!     let retrieved = planner.get(&dataset, &interval, &RequestConfig::default()).await?;
//!     println!("{:?}", retrieved.series.to_dataframe()?);
//!
//!     Ok(())
//! }
//! ```

// Core types and traits
pub use heliodata_core::*;

// Cache implementations
#[cfg(feature = "cache-sqlite")]
pub use heliodata_cache::SqliteCache;
pub use heliodata_cache::{InMemoryCache, NoopCache};

// Providers
#[cfg(feature = "amda")]
pub use heliodata_amda::{AmdaConfig, AmdaProvider};

// Cancellation handle accepted by `RequestPlanner::get_with_cancel`
pub use tokio_util::sync::CancellationToken;

mod config;
mod inflight;
mod planner;
mod registry;
mod retry;
#[cfg(test)]
mod testing;

pub use config::RequestConfig;
pub use planner::{FailedInterval, RequestPlanner, Retrieved};
pub use registry::ProviderRegistry;
