//! In-memory cache implementation.

use async_trait::async_trait;
use heliodata_core::cache::{assemble_read, plan_write};
use heliodata_core::{
    CacheEntry, CanonicalSeries, CoverageIndex, DatasetId, Result, RetentionPolicy, SeriesCache,
    TimeInterval, WriteOutcome,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Simple in-memory cache for testing and short-lived processes.
///
/// Entries are stored per dataset in an `RwLock`-protected `HashMap` and are
/// lost when the cache is dropped. Series are cloned on read and write, so
/// readers never observe a later eviction.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<DatasetId, Vec<CacheEntry>>>,
}

impl InMemoryCache {
    /// Create a new empty in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored entries across all datasets.
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SeriesCache for InMemoryCache {
    #[instrument(skip(self), fields(dataset = %dataset))]
    async fn coverage(&self, dataset: &DatasetId) -> Result<CoverageIndex> {
        let cache = self.entries.read().await;
        let coverage = cache
            .get(dataset)
            .map(|entries| CoverageIndex::from_intervals(entries.iter().map(|e| e.interval)))
            .unwrap_or_default();
        Ok(coverage)
    }

    #[instrument(skip(self), fields(dataset = %dataset, interval = %interval))]
    async fn read(&self, dataset: &DatasetId, interval: &TimeInterval) -> Result<CanonicalSeries> {
        let overlapping: Vec<CacheEntry> = {
            let cache = self.entries.read().await;
            cache
                .get(dataset)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| e.interval.intersects(interval))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let series = assemble_read(dataset, interval, overlapping)?;
        debug!("Cache hit: {} samples", series.len());
        Ok(series)
    }

    #[instrument(skip(self, entry), fields(dataset = %entry.dataset, interval = %entry.interval, samples = entry.series.len()))]
    async fn write_entry(&self, entry: CacheEntry) -> Result<WriteOutcome> {
        let dataset = entry.dataset.clone();
        let interval = entry.interval;

        let mut cache = self.entries.write().await;
        let entries = cache.entry(dataset).or_default();
        let overlapping: Vec<CacheEntry> = entries
            .iter()
            .filter(|e| e.interval.intersects(&interval))
            .cloned()
            .collect();

        let plan = plan_write(&overlapping, entry);
        entries.retain(|e| !plan.remove.contains(&e.interval));
        entries.extend(plan.insert);
        entries.sort_by_key(|e| e.interval);

        debug!(outcome = ?plan.outcome, "Cached fragment");
        Ok(plan.outcome)
    }

    #[instrument(skip(self), fields(dataset = %dataset))]
    async fn retain_version(&self, dataset: &DatasetId, version: &str) -> Result<usize> {
        let mut cache = self.entries.write().await;
        let Some(entries) = cache.get_mut(dataset) else {
            return Ok(0);
        };

        let before = entries.len();
        entries.retain(|e| e.is_version(version));
        let removed = before - entries.len();
        if entries.is_empty() {
            cache.remove(dataset);
        }
        if removed > 0 {
            debug!("Dropped {} entries of other versions", removed);
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn evict(&self, policy: RetentionPolicy) -> Result<usize> {
        let mut cache = self.entries.write().await;
        let before: usize = cache.values().map(Vec::len).sum();

        match policy {
            RetentionPolicy::MaxAge(ttl) => {
                for entries in cache.values_mut() {
                    entries.retain(|e| !e.is_stale(ttl));
                }
            }
            RetentionPolicy::MaxEntries(max) => {
                if before > max {
                    let mut by_age: Vec<_> = cache
                        .values()
                        .flatten()
                        .map(|e| (e.fetched_at, e.dataset.clone(), e.interval))
                        .collect();
                    by_age.sort();
                    for (_, dataset, interval) in by_age.into_iter().take(before - max) {
                        if let Some(entries) = cache.get_mut(&dataset) {
                            entries.retain(|e| e.interval != interval);
                        }
                    }
                }
            }
        }
        cache.retain(|_, entries| !entries.is_empty());

        let removed = before - cache.values().map(Vec::len).sum::<usize>();
        if removed > 0 {
            debug!("Evicted {} cache entries", removed);
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        debug!("Cleared all cache entries");
        Ok(())
    }
}
