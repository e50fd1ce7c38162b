//! The canonical time-series representation.
//!
//! Every provider parses its native response into a [`CanonicalSeries`]; the
//! cache stores them and the planner slices and concatenates them. Samples
//! are kept row-major: `values[i * arity..(i + 1) * arity]` belongs to
//! `timestamps[i]`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use polars::prelude::{Column, DataFrame, DataType, PlSmallStr, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};
use crate::interval::TimeInterval;

/// Descriptive metadata attached to a series.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    /// Names of the value fields, in field order.
    pub columns: Vec<String>,
    /// Physical units of the values.
    pub units: Option<String>,
    /// Sentinel used by the archive for missing samples.
    pub fill_value: Option<f64>,
    /// Any further provider-specific attributes.
    pub attributes: BTreeMap<String, String>,
}

impl SeriesMetadata {
    /// Creates metadata with the given column names.
    #[must_use]
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Sets the units.
    #[must_use]
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Sets the fill value.
    #[must_use]
    pub const fn fill_value(mut self, fill_value: f64) -> Self {
        self.fill_value = Some(fill_value);
        self
    }

    fn is_unset(&self) -> bool {
        self.columns.is_empty()
            && self.units.is_none()
            && self.fill_value.is_none()
            && self.attributes.is_empty()
    }

    fn same_content(&self, other: &Self) -> bool {
        self.columns == other.columns
            && self.units == other.units
            && self.fill_value.map(f64::to_bits) == other.fill_value.map(f64::to_bits)
            && self.attributes == other.attributes
    }
}

/// An ordered, time-tagged sequence of fixed-arity numeric samples.
///
/// Timestamps are strictly increasing and every sample has [`arity`] values.
/// An empty series is schema-neutral: it can be concatenated with any other.
///
/// [`arity`]: CanonicalSeries::arity
#[derive(Clone, Debug, Default)]
pub struct CanonicalSeries {
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<f64>,
    arity: usize,
    metadata: SeriesMetadata,
}

impl CanonicalSeries {
    /// Creates an empty series carrying `metadata`.
    #[must_use]
    pub fn empty(metadata: SeriesMetadata) -> Self {
        let arity = metadata.columns.len();
        Self {
            timestamps: Vec::new(),
            values: Vec::new(),
            arity,
            metadata,
        }
    }

    /// Builds a series from parsed rows.
    ///
    /// The arity is taken from the first row, or from the metadata columns
    /// when there are no rows.
    ///
    /// # Errors
    /// Returns [`DataError::SchemaMismatch`] when a row has a different
    /// arity and [`DataError::Parse`] when timestamps are not strictly
    /// increasing.
    pub fn from_rows<I>(metadata: SeriesMetadata, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (DateTime<Utc>, Vec<f64>)>,
    {
        let mut rows = rows.into_iter().peekable();
        let arity = rows
            .peek()
            .map_or(metadata.columns.len(), |(_, values)| values.len());

        let (lower, _) = rows.size_hint();
        let mut timestamps = Vec::with_capacity(lower);
        let mut values = Vec::with_capacity(lower * arity);
        for (timestamp, row) in rows {
            if row.len() != arity {
                return Err(DataError::SchemaMismatch {
                    expected: arity,
                    found: row.len(),
                });
            }
            if let Some(last) = timestamps.last() {
                if timestamp <= *last {
                    return Err(DataError::Parse(format!(
                        "timestamps not strictly increasing: {timestamp} follows {last}"
                    )));
                }
            }
            timestamps.push(timestamp);
            values.extend(row);
        }

        Ok(Self {
            timestamps,
            values,
            arity,
            metadata,
        })
    }

    /// Rebuilds a series from its column buffers.
    ///
    /// # Errors
    /// Returns [`DataError::Parse`] if the buffers are inconsistent.
    pub fn from_parts(
        metadata: SeriesMetadata,
        timestamps: Vec<DateTime<Utc>>,
        values: Vec<f64>,
        arity: usize,
    ) -> Result<Self> {
        if timestamps.len().checked_mul(arity) != Some(values.len()) {
            return Err(DataError::Parse(format!(
                "{} values cannot hold {} samples of arity {arity}",
                values.len(),
                timestamps.len()
            )));
        }
        if timestamps.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(DataError::Parse(
                "timestamps not strictly increasing".to_string(),
            ));
        }
        Ok(Self {
            timestamps,
            values,
            arity,
            metadata,
        })
    }

    /// Consumes the series and returns `(metadata, timestamps, values, arity)`.
    #[must_use]
    pub fn into_parts(self) -> (SeriesMetadata, Vec<DateTime<Utc>>, Vec<f64>, usize) {
        (self.metadata, self.timestamps, self.values, self.arity)
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Number of values per sample.
    #[must_use]
    pub const fn arity(&self) -> usize {
        self.arity
    }

    /// Series metadata.
    #[must_use]
    pub const fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    /// All sample timestamps.
    #[must_use]
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// All values, row-major.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The sample at `index`.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<(DateTime<Utc>, &[f64])> {
        let timestamp = *self.timestamps.get(index)?;
        let offset = index * self.arity;
        Some((timestamp, &self.values[offset..offset + self.arity]))
    }

    /// Iterates over `(timestamp, values)` samples.
    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, &[f64])> + '_ {
        (0..self.len()).filter_map(|index| self.row(index))
    }

    /// First and last timestamps.
    #[must_use]
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((*self.timestamps.first()?, *self.timestamps.last()?))
    }

    /// The samples whose timestamp lies in `[interval.start, interval.end)`.
    #[must_use]
    pub fn slice(&self, interval: &TimeInterval) -> Self {
        let lo = self.timestamps.partition_point(|t| *t < interval.start());
        let hi = self.timestamps.partition_point(|t| *t < interval.end());
        Self {
            timestamps: self.timestamps[lo..hi].to_vec(),
            values: self.values[lo * self.arity..hi * self.arity].to_vec(),
            arity: self.arity,
            metadata: self.metadata.clone(),
        }
    }

    /// Appends `other`, which must start strictly after `self` ends.
    ///
    /// # Errors
    /// Returns [`DataError::SchemaMismatch`] if both fragments are non-empty
    /// with different arities and [`DataError::UnorderedConcat`] if they
    /// overlap or are out of order.
    pub fn concat(mut self, other: Self) -> Result<Self> {
        if other.is_empty() {
            return Ok(self.adopt_metadata(other.metadata));
        }
        if self.is_empty() {
            return Ok(other.adopt_metadata(self.metadata));
        }
        if self.arity != other.arity {
            return Err(DataError::SchemaMismatch {
                expected: self.arity,
                found: other.arity,
            });
        }
        if let (Some(last), Some(first)) = (self.timestamps.last(), other.timestamps.first()) {
            if last >= first {
                return Err(DataError::UnorderedConcat {
                    left_last: last.to_rfc3339(),
                    right_first: first.to_rfc3339(),
                });
            }
        }
        self.timestamps.extend(other.timestamps);
        self.values.extend(other.values);
        Ok(self.adopt_metadata(other.metadata))
    }

    /// Concatenates fragments in the order given.
    ///
    /// # Errors
    /// Fails like [`concat`](Self::concat) on the first offending pair.
    pub fn concat_all(fragments: impl IntoIterator<Item = Self>) -> Result<Self> {
        fragments
            .into_iter()
            .try_fold(Self::default(), |merged, fragment| merged.concat(fragment))
    }

    /// Compares timestamps, values and metadata bit-for-bit, so that NaN fill
    /// values compare equal to themselves.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.arity == other.arity
            && self.timestamps == other.timestamps
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
            && self.metadata.same_content(&other.metadata)
    }

    /// Name of field `index`, falling back to `v{index}`.
    #[must_use]
    pub fn column_name(&self, index: usize) -> String {
        self.metadata
            .columns
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("v{index}"))
    }

    /// Exports the series as a DataFrame with a nanosecond `time` column
    /// followed by one `f64` column per field.
    ///
    /// # Errors
    /// Returns an error if a timestamp is outside the nanosecond range or
    /// column names collide.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let nanos = self
            .timestamps
            .iter()
            .map(|t| {
                t.timestamp_nanos_opt()
                    .ok_or_else(|| DataError::Other(format!("{t} is out of nanosecond range")))
            })
            .collect::<Result<Vec<i64>>>()?;

        let mut columns = Vec::with_capacity(self.arity + 1);
        columns.push(
            Column::new(PlSmallStr::from("time"), nanos)
                .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
                .map_err(|e| DataError::Other(e.to_string()))?,
        );
        for field in 0..self.arity {
            let column: Vec<f64> = self
                .values
                .iter()
                .skip(field)
                .step_by(self.arity)
                .copied()
                .collect();
            columns.push(Column::new(
                PlSmallStr::from(self.column_name(field).as_str()),
                column,
            ));
        }

        DataFrame::new(columns).map_err(|e| DataError::Other(e.to_string()))
    }

    fn adopt_metadata(mut self, fallback: SeriesMetadata) -> Self {
        if self.metadata.is_unset() {
            self.metadata = fallback;
        }
        self
    }
}
