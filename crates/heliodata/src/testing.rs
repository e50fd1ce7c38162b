//! Scripted provider for planner tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use heliodata_core::{
    CanonicalSeries, DataError, DataProvider, DatasetId, Result, SeriesMetadata, SeriesProvider,
    TimeInterval,
};

type ErrorFactory = Box<dyn Fn() -> DataError + Send + Sync>;

/// Serves one sample every 10 s, valued by its UNIX second, and records
/// every interval it is asked for.
pub(crate) struct MockProvider {
    name: String,
    delay: Duration,
    not_found: bool,
    failing: Vec<TimeInterval>,
    scripted: Mutex<VecDeque<ErrorFactory>>,
    calls: Mutex<Vec<TimeInterval>>,
    version: Mutex<Option<String>>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MockProvider {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            not_found: false,
            failing: Vec::new(),
            scripted: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            version: Mutex::new(None),
        }
    }

    /// Sleep this long inside every fetch.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer every fetch with `NotFound`.
    pub(crate) fn not_found(mut self) -> Self {
        self.not_found = true;
        self
    }

    /// Fetches intersecting `interval` always fail with `Unavailable`.
    pub(crate) fn failing_within(mut self, interval: TimeInterval) -> Self {
        self.failing.push(interval);
        self
    }

    /// The next `times` fetches fail with the error built by `error`.
    pub(crate) fn fail_next(
        self,
        times: usize,
        error: impl Fn() -> DataError + Send + Sync + Clone + 'static,
    ) -> Self {
        {
            let mut scripted = self.scripted.lock().unwrap();
            for _ in 0..times {
                scripted.push_back(Box::new(error.clone()));
            }
        }
        self
    }

    /// Report `version` as the current dataset version from now on.
    pub(crate) fn set_version(&self, version: Option<&str>) {
        *self.version.lock().unwrap() = version.map(str::to_string);
    }

    pub(crate) fn calls(&self) -> Vec<TimeInterval> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Samples every 10 s inside `interval`, valued by their UNIX second.
pub(crate) fn samples(interval: &TimeInterval) -> CanonicalSeries {
    let start = interval.start().timestamp();
    let first = start + (10 - start.rem_euclid(10)) % 10;
    let rows = (first..interval.end().timestamp())
        .step_by(10)
        .filter_map(|s| DateTime::from_timestamp(s, 0))
        .filter(|at| interval.contains(*at))
        .map(|at| (at, vec![at.timestamp() as f64]));
    CanonicalSeries::from_rows(SeriesMetadata::with_columns(["v"]), rows).unwrap()
}

pub(crate) fn iv(start: i64, end: i64) -> TimeInterval {
    TimeInterval::from_unix_seconds(start, end).unwrap()
}

impl DataProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted provider for tests"
    }
}

#[async_trait]
impl SeriesProvider for MockProvider {
    async fn fetch(&self, _dataset: &DatasetId, interval: &TimeInterval) -> Result<CanonicalSeries> {
        self.calls.lock().unwrap().push(*interval);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.scripted.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error());
        }
        if self.not_found {
            return Err(DataError::NotFound(interval.to_string()));
        }
        if self.failing.iter().any(|f| f.intersects(interval)) {
            return Err(DataError::Unavailable(format!("{interval} is down")));
        }
        Ok(samples(interval))
    }

    async fn version(&self, _dataset: &DatasetId) -> Result<Option<String>> {
        Ok(self.version.lock().unwrap().clone())
    }
}
