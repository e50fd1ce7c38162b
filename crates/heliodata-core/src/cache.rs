//! Cache trait for storing fetched series fragments.
//!
//! This module defines the [`SeriesCache`] trait, the [`CacheEntry`] unit of
//! storage and the backend-independent rules every implementation follows:
//! [`plan_write`] decides how an incoming fragment supersedes the entries it
//! overlaps, and [`assemble_read`] turns the entries overlapping a read into
//! one series.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::{
    coverage::CoverageIndex,
    dataset::DatasetId,
    error::{DataError, Result},
    interval::TimeInterval,
    series::CanonicalSeries,
};

/// One cached fragment: the data a provider returned for one interval.
///
/// An empty series is a confirmed-empty entry: the provider was asked and
/// had nothing for that interval. `version` is the dataset version the
/// provider reported when the fragment was fetched, if it reports one.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Dataset the fragment belongs to.
    pub dataset: DatasetId,
    /// Interval the fragment answers for.
    pub interval: TimeInterval,
    /// Samples inside `interval`.
    pub series: CanonicalSeries,
    /// When the fragment was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Dataset version the fragment was fetched at.
    pub version: Option<String>,
}

impl CacheEntry {
    /// Creates an entry fetched now. Samples outside `interval` are dropped.
    #[must_use]
    pub fn new(dataset: DatasetId, interval: TimeInterval, series: &CanonicalSeries) -> Self {
        Self {
            dataset,
            interval,
            series: series.slice(&interval),
            fetched_at: Utc::now(),
            version: None,
        }
    }

    /// Tags the entry with a dataset version.
    #[must_use]
    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    /// Returns true if the entry was fetched at `version`.
    #[must_use]
    pub fn is_version(&self, version: &str) -> bool {
        self.version.as_deref() == Some(version)
    }

    /// Returns true if the entry is older than `ttl`.
    #[must_use]
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        age > chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX)
    }

    /// The part of this entry inside `keep`, with the same fetch time.
    #[must_use]
    pub fn trimmed(&self, keep: TimeInterval) -> Self {
        Self {
            dataset: self.dataset.clone(),
            interval: keep,
            series: self.series.slice(&keep),
            fetched_at: self.fetched_at,
            version: self.version.clone(),
        }
    }
}

/// What a [`SeriesCache::write`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing overlapped; the entry was added.
    Inserted,
    /// Identical content was already stored; nothing changed.
    Unchanged,
    /// Overlapping entries were superseded by the new one.
    Replaced,
}

/// Retention policy applied by [`SeriesCache::evict`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Remove entries fetched longer ago than this.
    MaxAge(Duration),
    /// Keep at most this many entries, removing the oldest fetches first.
    MaxEntries(usize),
}

/// Changes a backend must apply atomically to perform a write.
#[derive(Debug)]
pub struct WritePlan {
    /// What the write amounts to.
    pub outcome: WriteOutcome,
    /// Intervals of existing entries to delete.
    pub remove: Vec<TimeInterval>,
    /// Entries to store after the deletions.
    pub insert: Vec<CacheEntry>,
}

/// Resolves `incoming` against the existing entries that intersect it.
///
/// A write is a no-op only when one existing entry of the same version
/// already holds identical content for the interval. Overlapped entries are never mutated: they are removed and the parts
/// outside the new interval are re-inserted as trimmed copies, so stored
/// entries stay disjoint.
#[must_use]
pub fn plan_write(overlapping: &[CacheEntry], incoming: CacheEntry) -> WritePlan {
    if let [existing] = overlapping {
        if existing.version == incoming.version
            && existing.interval.contains_interval(&incoming.interval)
            && existing
                .series
                .slice(&incoming.interval)
                .same_content(&incoming.series)
        {
            return WritePlan {
                outcome: WriteOutcome::Unchanged,
                remove: Vec::new(),
                insert: Vec::new(),
            };
        }
    }

    let outcome = if overlapping.is_empty() {
        WriteOutcome::Inserted
    } else {
        WriteOutcome::Replaced
    };
    let mut insert: Vec<CacheEntry> = overlapping
        .iter()
        .flat_map(|entry| {
            entry
                .interval
                .subtract(&incoming.interval)
                .into_iter()
                .map(|rest| entry.trimmed(rest))
        })
        .collect();
    insert.push(incoming);

    WritePlan {
        outcome,
        remove: overlapping.iter().map(|entry| entry.interval).collect(),
        insert,
    }
}

/// Builds the answer to a read from the entries intersecting `interval`.
///
/// # Errors
/// Returns [`DataError::UncoveredRead`] if the entries do not cover
/// `interval`, and propagates concat failures.
pub fn assemble_read(
    dataset: &DatasetId,
    interval: &TimeInterval,
    mut overlapping: Vec<CacheEntry>,
) -> Result<CanonicalSeries> {
    let coverage = CoverageIndex::from_intervals(overlapping.iter().map(|entry| entry.interval));
    if !coverage.covers(interval) {
        return Err(DataError::UncoveredRead {
            dataset: dataset.to_string(),
            interval: interval.to_string(),
        });
    }

    overlapping.sort_by_key(|entry| entry.interval);
    CanonicalSeries::concat_all(
        overlapping
            .iter()
            .map(|entry| entry.series.slice(interval)),
    )
}

/// Trait for caching fetched series fragments.
///
/// Implementations can store data in various backends (SQLite, in-memory,
/// etc.). Every mutation is atomic: a write or eviction is either fully
/// applied or not at all, and concurrent mutations are serialized.
#[async_trait]
pub trait SeriesCache: Send + Sync {
    /// Returns a snapshot of the covered ranges of `dataset`.
    async fn coverage(&self, dataset: &DatasetId) -> Result<CoverageIndex>;

    /// Reads the cached samples of `dataset` within `interval`.
    ///
    /// `interval` must be covered; anything else is a caller bug reported as
    /// [`DataError::UncoveredRead`].
    async fn read(&self, dataset: &DatasetId, interval: &TimeInterval) -> Result<CanonicalSeries>;

    /// Stores `entry`, superseding the entries it overlaps.
    async fn write_entry(&self, entry: CacheEntry) -> Result<WriteOutcome>;

    /// Stores `series` as the unversioned answer for `interval`.
    async fn write(
        &self,
        dataset: &DatasetId,
        interval: &TimeInterval,
        series: &CanonicalSeries,
    ) -> Result<WriteOutcome> {
        self.write_entry(CacheEntry::new(dataset.clone(), *interval, series))
            .await
    }

    /// Removes the entries of `dataset` not fetched at `version`.
    ///
    /// Returns the number of entries removed.
    async fn retain_version(&self, dataset: &DatasetId, version: &str) -> Result<usize>;

    /// Removes entries according to `policy`.
    ///
    /// Returns the number of entries removed.
    async fn evict(&self, policy: RetentionPolicy) -> Result<usize>;

    /// Clears all cached data.
    async fn clear(&self) -> Result<()>;
}
