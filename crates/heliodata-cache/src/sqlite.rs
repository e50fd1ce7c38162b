//! SQLite-based cache implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use heliodata_core::cache::{assemble_read, plan_write};
use heliodata_core::{
    CacheEntry, CanonicalSeries, CoverageIndex, DataError, DatasetId, Result, RetentionPolicy,
    SeriesCache, SeriesMetadata, TimeInterval, WriteOutcome,
};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, instrument};

/// SQLite-based cache for series fragments.
///
/// Each fragment is one row keyed by `(provider, dataset, start_ns, end_ns)`.
/// Timestamps and values are stored as little-endian binary blobs so that a
/// round-trip is bit-exact, fill values and NaN included. Every write runs in
/// a single transaction.
#[derive(Debug)]
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Create a new SQLite cache at the given path.
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| DataError::Cache(e.to_string()))?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    /// Create an in-memory SQLite cache.
    ///
    /// Useful for testing; data is lost when the cache is dropped.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| DataError::Cache(e.to_string()))?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Cache(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS series_cache (
                provider TEXT NOT NULL,
                dataset TEXT NOT NULL,
                start_ns INTEGER NOT NULL,
                end_ns INTEGER NOT NULL,
                arity INTEGER NOT NULL,
                timestamps_blob BLOB NOT NULL,
                values_blob BLOB NOT NULL,
                metadata_json TEXT NOT NULL,
                fill_value_bits INTEGER,
                fetched_at TEXT NOT NULL,
                version TEXT,
                PRIMARY KEY (provider, dataset, start_ns, end_ns)
            )",
            [],
        )
        .map_err(|e| DataError::Cache(e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_series_fetched_at
             ON series_cache(fetched_at)",
            [],
        )
        .map_err(|e| DataError::Cache(e.to_string()))?;

        debug!("SQLite cache schema initialized");
        Ok(())
    }

    /// Loads the entries of `dataset` intersecting `interval`.
    fn overlapping(
        conn: &Connection,
        dataset: &DatasetId,
        interval: &TimeInterval,
    ) -> Result<Vec<CacheEntry>> {
        let mut stmt = conn
            .prepare(
                "SELECT start_ns, end_ns, arity, timestamps_blob, values_blob, metadata_json, fill_value_bits, fetched_at, version
                 FROM series_cache
                 WHERE provider = ?1 AND dataset = ?2 AND start_ns < ?4 AND end_ns > ?3
                 ORDER BY start_ns ASC",
            )
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let rows = stmt
            .query_map(
                params![
                    dataset.provider(),
                    dataset.path(),
                    to_nanos(interval.start())?,
                    to_nanos(interval.end())?
                ],
                |row| {
                    Ok(StoredRow {
                        start_ns: row.get(0)?,
                        end_ns: row.get(1)?,
                        arity: row.get(2)?,
                        timestamps: row.get(3)?,
                        values: row.get(4)?,
                        metadata_json: row.get(5)?,
                        fill_value_bits: row.get(6)?,
                        fetched_at: row.get(7)?,
                        version: row.get(8)?,
                    })
                },
            )
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            let row = row.map_err(|e| DataError::Cache(e.to_string()))?;
            entries.push(row.into_entry(dataset)?);
        }
        Ok(entries)
    }

    fn insert(conn: &Connection, entry: &CacheEntry) -> Result<()> {
        let arity =
            i64::try_from(entry.series.arity()).map_err(|e| DataError::Cache(e.to_string()))?;
        let metadata_json = serde_json::to_string(entry.series.metadata())
            .map_err(|e| DataError::Cache(e.to_string()))?;
        // JSON has no NaN, so the fill value travels as raw bits.
        let fill_value_bits = entry
            .series
            .metadata()
            .fill_value
            .map(|v| i64::from_le_bytes(v.to_le_bytes()));

        conn.execute(
            "INSERT OR REPLACE INTO series_cache
             (provider, dataset, start_ns, end_ns, arity, timestamps_blob, values_blob, metadata_json, fill_value_bits, fetched_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.dataset.provider(),
                entry.dataset.path(),
                to_nanos(entry.interval.start())?,
                to_nanos(entry.interval.end())?,
                arity,
                encode_timestamps(entry.series.timestamps())?,
                encode_values(entry.series.values()),
                metadata_json,
                fill_value_bits,
                format_fetched_at(entry.fetched_at),
                entry.version,
            ],
        )
        .map_err(|e| DataError::Cache(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SeriesCache for SqliteCache {
    #[instrument(skip(self), fields(dataset = %dataset))]
    async fn coverage(&self, dataset: &DatasetId) -> Result<CoverageIndex> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT start_ns, end_ns FROM series_cache
                 WHERE provider = ?1 AND dataset = ?2",
            )
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let rows = stmt
            .query_map(params![dataset.provider(), dataset.path()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let mut intervals = Vec::new();
        for row in rows {
            let (start_ns, end_ns) = row.map_err(|e| DataError::Cache(e.to_string()))?;
            intervals.push(interval_from_nanos(start_ns, end_ns)?);
        }

        Ok(CoverageIndex::from_intervals(intervals))
    }

    #[instrument(skip(self), fields(dataset = %dataset, interval = %interval))]
    async fn read(&self, dataset: &DatasetId, interval: &TimeInterval) -> Result<CanonicalSeries> {
        let overlapping = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| DataError::Cache(e.to_string()))?;
            Self::overlapping(&conn, dataset, interval)?
        };

        let series = assemble_read(dataset, interval, overlapping)?;
        debug!("Found {} cached samples", series.len());
        Ok(series)
    }

    #[instrument(skip(self, entry), fields(dataset = %entry.dataset, interval = %entry.interval, samples = entry.series.len()))]
    async fn write_entry(&self, entry: CacheEntry) -> Result<WriteOutcome> {
        let dataset = entry.dataset.clone();
        let interval = entry.interval;

        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Cache(e.to_string()))?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let overlapping = Self::overlapping(&tx, &dataset, &interval)?;
        let plan = plan_write(&overlapping, entry);

        for removed in &plan.remove {
            tx.execute(
                "DELETE FROM series_cache
                 WHERE provider = ?1 AND dataset = ?2 AND start_ns = ?3 AND end_ns = ?4",
                params![
                    dataset.provider(),
                    dataset.path(),
                    to_nanos(removed.start())?,
                    to_nanos(removed.end())?
                ],
            )
            .map_err(|e| DataError::Cache(e.to_string()))?;
        }
        for entry in &plan.insert {
            Self::insert(&tx, entry)?;
        }

        tx.commit().map_err(|e| DataError::Cache(e.to_string()))?;
        debug!(outcome = ?plan.outcome, "Cached fragment");
        Ok(plan.outcome)
    }

    #[instrument(skip(self), fields(dataset = %dataset))]
    async fn retain_version(&self, dataset: &DatasetId, version: &str) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let deleted = conn
            .execute(
                "DELETE FROM series_cache
                 WHERE provider = ?1 AND dataset = ?2 AND (version IS NULL OR version != ?3)",
                params![dataset.provider(), dataset.path(), version],
            )
            .map_err(|e| DataError::Cache(e.to_string()))?;

        if deleted > 0 {
            debug!("Dropped {} entries of other versions", deleted);
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn evict(&self, policy: RetentionPolicy) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Cache(e.to_string()))?;

        let deleted = match policy {
            RetentionPolicy::MaxAge(ttl) => {
                // A cutoff before the earliest representable instant expires nothing.
                let cutoff = TimeDelta::from_std(ttl)
                    .ok()
                    .and_then(|age| Utc::now().checked_sub_signed(age));
                match cutoff {
                    Some(cutoff) => conn
                        .execute(
                            "DELETE FROM series_cache WHERE fetched_at < ?1",
                            params![format_fetched_at(cutoff)],
                        )
                        .map_err(|e| DataError::Cache(e.to_string()))?,
                    None => 0,
                }
            }
            RetentionPolicy::MaxEntries(max) => {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM series_cache", [], |row| row.get(0))
                    .map_err(|e| DataError::Cache(e.to_string()))?;
                let max = i64::try_from(max).unwrap_or(i64::MAX);
                if count <= max {
                    0
                } else {
                    conn.execute(
                        "DELETE FROM series_cache WHERE rowid IN (
                            SELECT rowid FROM series_cache ORDER BY fetched_at ASC LIMIT ?1
                        )",
                        params![count - max],
                    )
                    .map_err(|e| DataError::Cache(e.to_string()))?
                }
            }
        };

        if deleted > 0 {
            debug!("Evicted {} cache entries", deleted);
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Cache(e.to_string()))?;

        conn.execute("DELETE FROM series_cache", [])
            .map_err(|e| DataError::Cache(e.to_string()))?;

        debug!("Cleared all cache entries");
        Ok(())
    }
}

/// Raw column values of one `series_cache` row.
struct StoredRow {
    start_ns: i64,
    end_ns: i64,
    arity: i64,
    timestamps: Vec<u8>,
    values: Vec<u8>,
    metadata_json: String,
    fill_value_bits: Option<i64>,
    fetched_at: String,
    version: Option<String>,
}

impl StoredRow {
    fn into_entry(self, dataset: &DatasetId) -> Result<CacheEntry> {
        let mut metadata: SeriesMetadata = serde_json::from_str(&self.metadata_json)
            .map_err(|e| DataError::Cache(e.to_string()))?;
        metadata.fill_value = self
            .fill_value_bits
            .map(|bits| f64::from_le_bytes(bits.to_le_bytes()));
        let arity = usize::try_from(self.arity).map_err(|e| DataError::Cache(e.to_string()))?;
        let series = CanonicalSeries::from_parts(
            metadata,
            decode_timestamps(&self.timestamps)?,
            decode_values(&self.values)?,
            arity,
        )
        .map_err(|e| DataError::Cache(e.to_string()))?;
        let fetched_at = DateTime::parse_from_rfc3339(&self.fetched_at)
            .map_err(|e| DataError::Cache(e.to_string()))?
            .with_timezone(&Utc);

        Ok(CacheEntry {
            dataset: dataset.clone(),
            interval: interval_from_nanos(self.start_ns, self.end_ns)?,
            series,
            fetched_at,
            version: self.version,
        })
    }
}

/// Fixed-width RFC 3339 so that string order matches time order.
fn format_fetched_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_nanos(at: DateTime<Utc>) -> Result<i64> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| DataError::Cache(format!("{at} cannot be stored as nanoseconds")))
}

fn interval_from_nanos(start_ns: i64, end_ns: i64) -> Result<TimeInterval> {
    TimeInterval::new(
        DateTime::from_timestamp_nanos(start_ns),
        DateTime::from_timestamp_nanos(end_ns),
    )
    .map_err(|e| DataError::Cache(e.to_string()))
}

fn encode_timestamps(timestamps: &[DateTime<Utc>]) -> Result<Vec<u8>> {
    let mut blob = Vec::with_capacity(timestamps.len() * 8);
    for at in timestamps {
        blob.extend_from_slice(&to_nanos(*at)?.to_le_bytes());
    }
    Ok(blob)
}

fn decode_timestamps(blob: &[u8]) -> Result<Vec<DateTime<Utc>>> {
    let chunks = blob.chunks_exact(8);
    if !chunks.remainder().is_empty() {
        return Err(DataError::Cache("truncated timestamp blob".to_string()));
    }
    Ok(chunks
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            DateTime::from_timestamp_nanos(i64::from_le_bytes(bytes))
        })
        .collect())
}

fn encode_values(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_values(blob: &[u8]) -> Result<Vec<f64>> {
    let chunks = blob.chunks_exact(8);
    if !chunks.remainder().is_empty() {
        return Err(DataError::Cache("truncated value blob".to_string()));
    }
    Ok(chunks
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect())
}
