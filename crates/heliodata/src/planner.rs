//! Request planning: cache lookup, gap fetching and assembly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::TimeDelta;
use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use heliodata_core::{
    CacheEntry, CanonicalSeries, DataError, DatasetId, Result, RetentionPolicy, SeriesCache,
    SeriesProvider, TimeInterval, gap_subtract,
};
use tokio::sync::OwnedMutexGuard;

use crate::config::RequestConfig;
use crate::inflight::{ClaimGuard, ClaimTable, ClaimWaiter};
use crate::registry::ProviderRegistry;
use crate::retry::fetch_with_retry;

/// A sub-interval that could not be resolved.
#[derive(Debug)]
pub struct FailedInterval {
    /// The unresolved range.
    pub interval: TimeInterval,
    /// Why it could not be resolved.
    pub error: DataError,
}

/// Result of a [`RequestPlanner::get`] call.
#[derive(Debug)]
pub struct Retrieved {
    /// Samples of the requested interval, in timestamp order. Ranges listed
    /// in `failed` contribute nothing.
    pub series: CanonicalSeries,
    /// Sub-intervals that could not be fetched, in time order.
    pub failed: Vec<FailedInterval>,
    /// Number of provider fetches this request performed successfully.
    pub fetched: usize,
}

impl Retrieved {
    /// Returns true if every part of the requested interval was resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-request bookkeeping across planning rounds.
#[derive(Debug, Default)]
struct Progress {
    fragments: Vec<(TimeInterval, CanonicalSeries)>,
    failed: Vec<FailedInterval>,
    fetched: usize,
}

impl Progress {
    /// Intervals this request already fetched or gave up on.
    fn settled(&self) -> impl Iterator<Item = TimeInterval> + '_ {
        self.fragments
            .iter()
            .map(|(interval, _)| *interval)
            .chain(self.failed.iter().map(|failure| failure.interval))
    }
}

type LockMap = Mutex<HashMap<DatasetId, Arc<tokio::sync::Mutex<()>>>>;

/// Holds a dataset's planning lock. On drop the lock is released and its map
/// entry removed once no other request holds or awaits it.
struct PlanningLock<'a> {
    locks: &'a LockMap,
    dataset: DatasetId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PlanningLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.dataset)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.dataset);
        }
    }
}

/// What one planning round decided.
struct Round {
    fetches: Vec<(TimeInterval, ClaimGuard)>,
    waits: Vec<ClaimWaiter>,
}

/// Answers `(dataset, interval)` requests from the cache and the providers.
///
/// For each request the planner reads the dataset's coverage, fetches only
/// the missing sub-intervals (concurrently, with retries), writes every
/// result to the cache and assembles one time-ordered series. Concurrent
/// requests for overlapping ranges of the same dataset never fetch the same
/// sub-interval twice: planning is serialized per dataset and sub-intervals
/// being fetched are claimed until their result is cached.
///
/// When the provider reports a dataset version, cached fragments fetched at
/// any other version are dropped before planning, so they are fetched again.
pub struct RequestPlanner {
    registry: Arc<ProviderRegistry>,
    cache: Arc<dyn SeriesCache>,
    claims: Arc<ClaimTable>,
    locks: LockMap,
}

impl std::fmt::Debug for RequestPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPlanner")
            .field("registry", &self.registry)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl RequestPlanner {
    /// Create a planner over a provider registry and a cache.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, cache: Arc<dyn SeriesCache>) -> Self {
        Self {
            registry,
            cache,
            claims: Arc::new(ClaimTable::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The provider registry.
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// The cache store.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn SeriesCache> {
        &self.cache
    }

    /// Retrieve `dataset` over `interval`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the dataset's
    /// provider is not registered, the cache fails, or `fail_fast` is set
    /// and a sub-interval fails. Otherwise sub-interval failures are listed
    /// in [`Retrieved::failed`].
    pub async fn get(
        &self,
        dataset: &DatasetId,
        interval: &TimeInterval,
        config: &RequestConfig,
    ) -> Result<Retrieved> {
        self.get_with_cancel(dataset, interval, config, &CancellationToken::new())
            .await
    }

    /// Like [`get`](Self::get), stopping early once `cancel` fires.
    ///
    /// Fetches not yet started are skipped and backoff sleeps end at once.
    /// Fetches already running are awaited and cached before the call
    /// returns [`DataError::Cancelled`].
    ///
    /// # Errors
    /// As for [`get`](Self::get), plus [`DataError::Cancelled`].
    #[instrument(skip(self, config, cancel), fields(dataset = %dataset, interval = %interval))]
    pub async fn get_with_cancel(
        &self,
        dataset: &DatasetId,
        interval: &TimeInterval,
        config: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Result<Retrieved> {
        config.validate()?;
        let provider = self.registry.provider_for(dataset)?;

        if let Some(ttl) = config.cache_ttl {
            let evicted = self.cache.evict(RetentionPolicy::MaxAge(ttl)).await?;
            if evicted > 0 {
                debug!("Evicted {} expired cache entries", evicted);
            }
        }

        let version = match provider.version(dataset).await {
            Ok(version) => version,
            Err(error) => {
                warn!(%error, "Could not determine dataset version, keeping cached data");
                None
            }
        };

        let mut progress = Progress::default();
        loop {
            if cancel.is_cancelled() {
                return Err(DataError::Cancelled);
            }

            let round = self
                .plan(dataset, interval, config, version.as_deref(), &progress)
                .await?;
            if round.fetches.is_empty() && round.waits.is_empty() {
                break;
            }

            self.run_fetches(
                provider.as_ref(),
                dataset,
                config,
                version.as_deref(),
                cancel,
                round.fetches,
                &mut progress,
            )
            .await?;
            if cancel.is_cancelled() {
                return Err(DataError::Cancelled);
            }

            for waiter in round.waits {
                debug!(claimed = %waiter.interval, "Waiting for concurrent fetch");
                tokio::select! {
                    () = cancel.cancelled() => return Err(DataError::Cancelled),
                    () = waiter.released() => {}
                }
            }
        }

        self.assemble(dataset, interval, progress).await
    }

    /// Retrieve several datasets over the same interval concurrently.
    ///
    /// Duplicate ids are retrieved once.
    ///
    /// # Errors
    /// Returns the first error any of the underlying
    /// [`get`](Self::get) calls returns.
    pub async fn get_many(
        &self,
        datasets: &[DatasetId],
        interval: &TimeInterval,
        config: &RequestConfig,
    ) -> Result<HashMap<DatasetId, Retrieved>> {
        let mut unique: Vec<&DatasetId> = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            if !unique.contains(&dataset) {
                unique.push(dataset);
            }
        }

        let results = try_join_all(unique.into_iter().map(|dataset| async move {
            let retrieved = self.get(dataset, interval, config).await?;
            Ok::<_, DataError>((dataset.clone(), retrieved))
        }))
        .await?;

        Ok(results.into_iter().collect())
    }

    async fn lock_dataset(&self, dataset: &DatasetId) -> PlanningLock<'_> {
        let mut planning = PlanningLock {
            locks: &self.locks,
            dataset: dataset.clone(),
            guard: None,
        };
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(dataset.clone()).or_default())
        };
        planning.guard = Some(lock.lock_owned().await);
        planning
    }

    /// One planning round under the dataset lock.
    ///
    /// Claims are snapshotted before coverage is read. A fetch caches its
    /// result before releasing its claim, so every range is either covered,
    /// claimed by someone else, or ours to fetch.
    async fn plan(
        &self,
        dataset: &DatasetId,
        interval: &TimeInterval,
        config: &RequestConfig,
        version: Option<&str>,
        progress: &Progress,
    ) -> Result<Round> {
        let _planning = self.lock_dataset(dataset).await;

        if let Some(version) = version {
            let dropped = self.cache.retain_version(dataset, version).await?;
            if dropped > 0 {
                debug!(version, "Dropped {} fragments of other versions", dropped);
            }
        }

        let claimed = self.claims.overlapping(dataset, interval);
        let coverage = self.cache.coverage(dataset).await?;

        let mut resolved: Vec<TimeInterval> = coverage.present(interval);
        resolved.extend(progress.settled());
        let missing = gap_subtract(interval, &resolved);

        let claimed_intervals: Vec<TimeInterval> = claimed.iter().map(|c| c.interval).collect();
        let mut to_fetch = Vec::new();
        for gap in &missing {
            for part in gap_subtract(gap, &claimed_intervals) {
                to_fetch.extend(split(part, config)?);
            }
        }
        to_fetch.sort();
        to_fetch.dedup();

        let waits: Vec<ClaimWaiter> = claimed
            .into_iter()
            .filter(|c| missing.iter().any(|gap| gap.intersects(&c.interval)))
            .collect();

        debug!(
            covered = coverage.intervals().len(),
            fetches = to_fetch.len(),
            waits = waits.len(),
            "Planned round"
        );

        let fetches = to_fetch
            .into_iter()
            .map(|part| (part, self.claims.claim(dataset, part)))
            .collect();
        Ok(Round { fetches, waits })
    }

    /// Fetches the claimed sub-intervals, caching each result before its
    /// claim is released.
    #[allow(clippy::too_many_arguments)]
    async fn run_fetches(
        &self,
        provider: &dyn SeriesProvider,
        dataset: &DatasetId,
        config: &RequestConfig,
        version: Option<&str>,
        cancel: &CancellationToken,
        fetches: Vec<(TimeInterval, ClaimGuard)>,
        progress: &mut Progress,
    ) -> Result<()> {
        let mut results = stream::iter(fetches)
            .map(|(part, claim)| async move {
                if cancel.is_cancelled() {
                    return (part, Err(DataError::Cancelled));
                }
                debug!(provider = provider.name(), %part, "Fetching");
                let result = fetch_with_retry(provider, dataset, &part, config, cancel).await;
                if let Ok(series) = &result {
                    let entry = CacheEntry::new(dataset.clone(), part, series)
                        .with_version(version.map(str::to_string));
                    match self.cache.write_entry(entry).await {
                        Ok(outcome) => debug!(%part, ?outcome, "Cached fetched fragment"),
                        Err(e) => warn!(%part, error = %e, "Failed to cache fetched fragment"),
                    }
                }
                drop(claim);
                (part, result)
            })
            .buffer_unordered(config.max_parallel_fetches);

        while let Some((part, result)) = results.next().await {
            match result {
                Ok(series) => {
                    progress.fetched += 1;
                    progress.fragments.push((part, series.slice(&part)));
                }
                Err(DataError::Cancelled) => {}
                Err(error) if config.fail_fast => {
                    warn!(%part, %error, "Aborting request");
                    return Err(DataError::FetchFailed {
                        interval: part.to_string(),
                        source: Box::new(error),
                    });
                }
                Err(error) => {
                    warn!(%part, %error, "Sub-interval failed");
                    progress.failed.push(FailedInterval {
                        interval: part,
                        error,
                    });
                }
            }
        }
        Ok(())
    }

    /// Builds the answer from this request's own fragments plus cache reads
    /// for everything else it found covered.
    async fn assemble(
        &self,
        dataset: &DatasetId,
        interval: &TimeInterval,
        progress: Progress,
    ) -> Result<Retrieved> {
        let Progress {
            mut fragments,
            mut failed,
            fetched,
        } = progress;

        let own: Vec<TimeInterval> = fragments
            .iter()
            .map(|(part, _)| *part)
            .chain(failed.iter().map(|failure| failure.interval))
            .collect();
        let rest = gap_subtract(interval, &own);

        if !rest.is_empty() {
            let coverage = self.cache.coverage(dataset).await?;
            for part in rest {
                for present in coverage.present(&part) {
                    match self.cache.read(dataset, &present).await {
                        Ok(series) => fragments.push((present, series)),
                        Err(error) => failed.push(FailedInterval {
                            interval: present,
                            error,
                        }),
                    }
                }
                for gap in gap_subtract(&part, coverage.intervals()) {
                    // Evicted between planning and assembly
                    failed.push(FailedInterval {
                        interval: gap,
                        error: DataError::UncoveredRead {
                            dataset: dataset.to_string(),
                            interval: gap.to_string(),
                        },
                    });
                }
            }
        }

        fragments.sort_by_key(|(part, _)| *part);
        failed.sort_by_key(|failure| failure.interval);
        let series =
            CanonicalSeries::concat_all(fragments.into_iter().map(|(_, series)| series))?;

        debug!(
            samples = series.len(),
            fetched,
            failed = failed.len(),
            "Assembled request"
        );
        Ok(Retrieved {
            series,
            failed,
            fetched,
        })
    }
}

/// Cuts `part` at fragment boundaries when a fragment duration is set.
fn split(part: TimeInterval, config: &RequestConfig) -> Result<Vec<TimeInterval>> {
    match config.fragment_duration {
        Some(duration) => {
            let step = TimeDelta::from_std(duration)
                .map_err(|e| DataError::InvalidParameter(e.to_string()))?;
            part.split_aligned(step)
        }
        None => Ok(vec![part]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProvider, iv, samples};
    use heliodata_cache::{InMemoryCache, NoopCache};
    use std::time::Duration;

    fn setup(provider: MockProvider) -> (Arc<MockProvider>, Arc<InMemoryCache>, RequestPlanner) {
        let provider = Arc::new(provider);
        let cache = Arc::new(InMemoryCache::new());
        let registry = ProviderRegistry::new().with_provider(provider.clone());
        let planner = RequestPlanner::new(Arc::new(registry), cache.clone());
        (provider, cache, planner)
    }

    fn dataset() -> DatasetId {
        DatasetId::new("mock", "imf")
    }

    fn quick() -> RequestConfig {
        RequestConfig::new()
            .with_retry_limit(0)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn seconds(series: &CanonicalSeries) -> Vec<i64> {
        series.timestamps().iter().map(|t| t.timestamp()).collect()
    }

    #[tokio::test]
    async fn test_get_fetches_missing_and_caches() {
        let (provider, cache, planner) = setup(MockProvider::new("mock"));

        let retrieved = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();

        assert!(retrieved.is_complete());
        assert_eq!(retrieved.fetched, 1);
        assert!(retrieved.series.same_content(&samples(&iv(0, 100))));
        assert_eq!(provider.calls(), vec![iv(0, 100)]);
        let coverage = cache.coverage(&dataset()).await.unwrap();
        assert_eq!(coverage.intervals(), &[iv(0, 100)]);
    }

    #[tokio::test]
    async fn test_get_twice_fetches_once() {
        let (provider, _cache, planner) = setup(MockProvider::new("mock"));

        let first = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        let second = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();

        assert_eq!(second.fetched, 0);
        assert_eq!(provider.call_count(), 1);
        assert!(first.series.same_content(&second.series));
    }

    #[tokio::test]
    async fn test_only_gaps_are_fetched() {
        let (provider, cache, planner) = setup(MockProvider::new("mock"));

        planner.get(&dataset(), &iv(20, 50), &quick()).await.unwrap();
        planner.get(&dataset(), &iv(80, 90), &quick()).await.unwrap();
        let retrieved = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();

        let mut gaps = provider.calls()[2..].to_vec();
        gaps.sort();
        assert_eq!(gaps, vec![iv(0, 20), iv(50, 80), iv(90, 100)]);
        assert_eq!(retrieved.fetched, 3);
        assert_eq!(
            seconds(&retrieved.series),
            vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]
        );
        assert_eq!(
            cache.coverage(&dataset()).await.unwrap().intervals(),
            &[iv(0, 100)]
        );
    }

    #[tokio::test]
    async fn test_not_found_is_cached_as_confirmed_empty() {
        let (provider, cache, planner) = setup(MockProvider::new("mock").not_found());

        let first = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        assert!(first.is_complete());
        assert!(first.series.is_empty());
        assert!(cache.coverage(&dataset()).await.unwrap().covers(&iv(0, 100)));

        let second = planner.get(&dataset(), &iv(10, 60), &quick()).await.unwrap();
        assert!(second.series.is_empty());
        assert_eq!(second.fetched, 0);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_returns_cached_part() {
        let (_, cache, planner) = setup(MockProvider::new("mock"));
        planner.get(&dataset(), &iv(0, 40), &quick()).await.unwrap();

        // Same cache, provider now down for the rest of the range
        let failing = Arc::new(MockProvider::new("mock").failing_within(iv(40, 100)));
        let registry = ProviderRegistry::new().with_provider(failing.clone());
        let planner = RequestPlanner::new(Arc::new(registry), cache);

        let retrieved = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();

        assert_eq!(seconds(&retrieved.series), vec![0, 10, 20, 30]);
        assert_eq!(retrieved.failed.len(), 1);
        assert_eq!(retrieved.failed[0].interval, iv(40, 100));
        assert!(matches!(
            retrieved.failed[0].error,
            DataError::Unavailable(_)
        ));
        assert_eq!(failing.calls(), vec![iv(40, 100)]);
    }

    #[tokio::test]
    async fn test_request_matching_cached_entry_is_exact() {
        let (provider, _cache, planner) = setup(MockProvider::new("mock"));
        planner.get(&dataset(), &iv(10, 20), &quick()).await.unwrap();

        let retrieved = planner.get(&dataset(), &iv(10, 20), &quick()).await.unwrap();

        assert_eq!(retrieved.fetched, 0);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(seconds(&retrieved.series), vec![10]);
        assert_eq!(retrieved.series.values(), &[10.0]);
    }

    #[tokio::test]
    async fn test_concurrent_overlapping_requests_never_double_fetch() {
        let (provider, cache, planner) =
            setup(MockProvider::new("mock").with_delay(Duration::from_millis(50)));
        let planner = Arc::new(planner);

        let requests = [iv(0, 100), iv(50, 150), iv(20, 130), iv(0, 150)];
        let handles: Vec<_> = requests
            .iter()
            .map(|interval| {
                let planner = Arc::clone(&planner);
                let interval = *interval;
                tokio::spawn(async move { planner.get(&dataset(), &interval, &quick()).await })
            })
            .collect();

        for (handle, interval) in handles.into_iter().zip(requests) {
            let retrieved = handle.await.unwrap().unwrap();
            assert!(retrieved.is_complete());
            assert!(retrieved.series.same_content(&samples(&interval)));
        }

        let calls = provider.calls();
        for (i, a) in calls.iter().enumerate() {
            for b in &calls[i + 1..] {
                assert!(!a.intersects(b), "{a} fetched twice via {b}");
            }
        }
        assert_eq!(
            cache.coverage(&dataset()).await.unwrap().intervals(),
            &[iv(0, 150)]
        );
        assert_eq!(planner.claims.active(&dataset()), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts() {
        let (_, _, planner) = setup(MockProvider::new("mock").failing_within(iv(50, 60)));
        let config = quick()
            .with_fail_fast(true)
            .with_fragment_duration(Duration::from_secs(50));

        let err = planner.get(&dataset(), &iv(0, 100), &config).await.unwrap_err();

        match err {
            DataError::FetchFailed { interval, source } => {
                assert_eq!(interval, iv(50, 100).to_string());
                assert!(matches!(*source, DataError::Unavailable(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(planner.claims.active(&dataset()), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_fetches_nothing() {
        let (provider, _, planner) = setup(MockProvider::new("mock"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = planner
            .get_with_cancel(&dataset(), &iv(0, 100), &quick(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DataError::Cancelled));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_keeps_finished_fetches_and_skips_the_rest() {
        let (provider, cache, planner) =
            setup(MockProvider::new("mock").with_delay(Duration::from_millis(50)));
        let config = quick()
            .with_max_parallel_fetches(1)
            .with_fragment_duration(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let err = planner
            .get_with_cancel(&dataset(), &iv(0, 100), &config, &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, DataError::Cancelled));
        assert_eq!(provider.calls(), vec![iv(0, 10)]);
        assert_eq!(
            cache.coverage(&dataset()).await.unwrap().intervals(),
            &[iv(0, 10)]
        );
        assert_eq!(planner.claims.active(&dataset()), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_releases_claims() {
        let (provider, cache, planner) =
            setup(MockProvider::new("mock").with_delay(Duration::from_millis(200)));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), planner.get(&dataset(), &iv(0, 100), &quick()))
                .await;
        assert!(abandoned.is_err());
        assert_eq!(planner.claims.active(&dataset()), 0);
        assert!(cache.coverage(&dataset()).await.unwrap().is_empty());

        let retrieved = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        assert!(retrieved.is_complete());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_recover_transient_failures() {
        let (provider, _, planner) = setup(
            MockProvider::new("mock").fail_next(2, || DataError::RateLimited {
                provider: "mock".into(),
                retry_after: Some(Duration::from_millis(1)),
            }),
        );

        let retrieved = planner
            .get(&dataset(), &iv(0, 100), &quick().with_retry_limit(3))
            .await
            .unwrap();

        assert!(retrieved.is_complete());
        assert_eq!(retrieved.series.len(), 10);
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fragment_duration_splits_on_aligned_boundaries() {
        let (provider, cache, planner) = setup(MockProvider::new("mock"));
        let config = quick().with_fragment_duration(Duration::from_secs(30));

        let retrieved = planner.get(&dataset(), &iv(5, 100), &config).await.unwrap();

        let mut calls = provider.calls();
        calls.sort();
        assert_eq!(calls, vec![iv(5, 30), iv(30, 60), iv(60, 90), iv(90, 100)]);
        assert_eq!(retrieved.fetched, 4);
        assert_eq!(seconds(&retrieved.series), vec![10, 20, 30, 40, 50, 60, 70, 80, 90]);
        assert_eq!(
            cache.coverage(&dataset()).await.unwrap().intervals(),
            &[iv(5, 100)]
        );
    }

    #[tokio::test]
    async fn test_noop_cache_still_answers() {
        let provider = Arc::new(MockProvider::new("mock"));
        let registry = ProviderRegistry::new().with_provider(provider.clone());
        let planner = RequestPlanner::new(Arc::new(registry), Arc::new(NoopCache::new()));

        let first = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        let second = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();

        assert!(first.series.same_content(&samples(&iv(0, 100))));
        assert!(second.series.same_content(&first.series));
        assert_eq!(provider.call_count(), 2);
    }

    #[cfg(feature = "cache-sqlite")]
    #[tokio::test]
    async fn test_persistent_cache_survives_planner() {
        use heliodata_cache::SqliteCache;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heliodata.sqlite");
        let provider = Arc::new(MockProvider::new("mock"));
        let registry = Arc::new(ProviderRegistry::new().with_provider(provider.clone()));

        {
            let planner =
                RequestPlanner::new(Arc::clone(&registry), Arc::new(SqliteCache::new(&path).unwrap()));
            planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        }

        let planner = RequestPlanner::new(registry, Arc::new(SqliteCache::new(&path).unwrap()));
        let retrieved = planner.get(&dataset(), &iv(30, 70), &quick()).await.unwrap();
        assert_eq!(retrieved.fetched, 0);
        assert_eq!(seconds(&retrieved.series), vec![30, 40, 50, 60]);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_ttl_forces_refetch() {
        let (provider, _, planner) = setup(MockProvider::new("mock"));
        planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let config = quick().with_cache_ttl(Duration::from_millis(1));
        let retrieved = planner.get(&dataset(), &iv(0, 100), &config).await.unwrap();

        assert_eq!(retrieved.fetched, 1);
        assert_eq!(provider.call_count(), 2);
    }

    #[cfg(feature = "cache-sqlite")]
    #[tokio::test]
    async fn test_unbounded_cache_ttl_keeps_persistent_entries() {
        use heliodata_cache::SqliteCache;

        let provider = Arc::new(MockProvider::new("mock"));
        let registry = ProviderRegistry::new().with_provider(provider.clone());
        let planner = RequestPlanner::new(Arc::new(registry), Arc::new(SqliteCache::in_memory().unwrap()));
        planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();

        for ttl in [Duration::from_secs(10_000_000_000_000), Duration::MAX] {
            let retrieved = planner
                .get(&dataset(), &iv(0, 100), &quick().with_cache_ttl(ttl))
                .await
                .unwrap();
            assert_eq!(retrieved.fetched, 0);
            assert_eq!(retrieved.series.len(), 10);
        }
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_version_change_refetches_cached_fragments() {
        let (provider, cache, planner) = setup(MockProvider::new("mock"));
        provider.set_version(Some("2024-01-01"));

        planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        let unchanged = planner.get(&dataset(), &iv(20, 60), &quick()).await.unwrap();
        assert_eq!(unchanged.fetched, 0);
        assert_eq!(provider.call_count(), 1);

        provider.set_version(Some("2024-06-01"));
        let refreshed = planner.get(&dataset(), &iv(20, 60), &quick()).await.unwrap();

        assert_eq!(refreshed.fetched, 1);
        assert_eq!(provider.calls(), vec![iv(0, 100), iv(20, 60)]);
        assert_eq!(seconds(&refreshed.series), vec![20, 30, 40, 50]);
        // Fragments of the old version are gone, not just shadowed
        assert_eq!(
            cache.coverage(&dataset()).await.unwrap().intervals(),
            &[iv(20, 60)]
        );

        let again = planner.get(&dataset(), &iv(20, 60), &quick()).await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unversioned_fragments_dropped_once_version_known() {
        let (provider, _cache, planner) = setup(MockProvider::new("mock"));
        planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();
        assert_eq!(provider.call_count(), 1);

        provider.set_version(Some("2024-01-01"));
        let retrieved = planner.get(&dataset(), &iv(0, 100), &quick()).await.unwrap();

        assert_eq!(retrieved.fetched, 1);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_dataset_locks_are_pruned() {
        let (_, _, planner) =
            setup(MockProvider::new("mock").with_delay(Duration::from_millis(20)));
        let planner = Arc::new(planner);

        let handles: Vec<_> = ["bx", "by", "bx", "bz"]
            .into_iter()
            .map(|path| {
                let planner = Arc::clone(&planner);
                tokio::spawn(async move {
                    planner
                        .get(&DatasetId::new("mock", path), &iv(0, 100), &quick())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(planner.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider_and_bad_config() {
        let (_, _, planner) = setup(MockProvider::new("mock"));

        let err = planner
            .get(&DatasetId::new("cdaweb", "imf"), &iv(0, 100), &quick())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::ProviderNotConfigured(_)));

        let err = planner
            .get(&dataset(), &iv(0, 100), &quick().with_max_parallel_fetches(0))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_get_many_deduplicates_datasets() {
        let (provider, _, planner) = setup(MockProvider::new("mock"));
        let bx = DatasetId::new("mock", "bx");
        let by = DatasetId::new("mock", "by");

        let results = planner
            .get_many(&[bx.clone(), by.clone(), bx.clone()], &iv(0, 50), &quick())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[&bx].series.len(), 5);
        assert_eq!(results[&by].series.len(), 5);
        assert_eq!(provider.call_count(), 2);
    }
}
