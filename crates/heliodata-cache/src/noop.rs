//! No-op cache implementation.

use async_trait::async_trait;
use heliodata_core::{
    CacheEntry, CanonicalSeries, CoverageIndex, DataError, DatasetId, Result, RetentionPolicy,
    SeriesCache, TimeInterval, WriteOutcome,
};
use tracing::trace;

/// A no-op cache that doesn't store anything.
///
/// Coverage is always empty, so every request goes to the provider. Writes
/// succeed without storing and reads fail with [`DataError::UncoveredRead`],
/// which the planner never triggers because nothing is ever covered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl NoopCache {
    /// Create a new no-op cache.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SeriesCache for NoopCache {
    async fn coverage(&self, _dataset: &DatasetId) -> Result<CoverageIndex> {
        trace!("NoopCache: coverage called, returning empty index");
        Ok(CoverageIndex::new())
    }

    async fn read(&self, dataset: &DatasetId, interval: &TimeInterval) -> Result<CanonicalSeries> {
        trace!("NoopCache: read called, nothing is covered");
        Err(DataError::UncoveredRead {
            dataset: dataset.to_string(),
            interval: interval.to_string(),
        })
    }

    async fn write_entry(&self, _entry: CacheEntry) -> Result<WriteOutcome> {
        trace!("NoopCache: write called, doing nothing");
        Ok(WriteOutcome::Inserted)
    }

    async fn retain_version(&self, _dataset: &DatasetId, _version: &str) -> Result<usize> {
        trace!("NoopCache: retain_version called, returning 0");
        Ok(0)
    }

    async fn evict(&self, _policy: RetentionPolicy) -> Result<usize> {
        trace!("NoopCache: evict called, returning 0");
        Ok(0)
    }

    async fn clear(&self) -> Result<()> {
        trace!("NoopCache: clear called, doing nothing");
        Ok(())
    }
}
