//! Bounded retries with exponential backoff around one provider fetch.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use heliodata_core::{CanonicalSeries, DataError, DatasetId, Result, SeriesProvider, TimeInterval};

use crate::config::RequestConfig;

/// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped at
/// `backoff_max`.
pub(crate) fn backoff_delay(config: &RequestConfig, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    config
        .backoff_base
        .checked_mul(factor)
        .map_or(config.backoff_max, |delay| delay.min(config.backoff_max))
}

/// Fetches one sub-interval, retrying retryable failures.
///
/// `NotFound` becomes an empty series so that it is cached as
/// confirmed-empty. A timed-out call counts as `Unavailable`. Cancellation
/// interrupts backoff sleeps but never a call already in progress.
pub(crate) async fn fetch_with_retry(
    provider: &dyn SeriesProvider,
    dataset: &DatasetId,
    interval: &TimeInterval,
    config: &RequestConfig,
    cancel: &CancellationToken,
) -> Result<CanonicalSeries> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(DataError::Cancelled);
        }

        let result = match config.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, provider.fetch(dataset, interval))
                .await
                .unwrap_or_else(|_| {
                    Err(DataError::Unavailable(format!(
                        "{} did not answer within {:?}",
                        provider.name(),
                        limit
                    )))
                }),
            None => provider.fetch(dataset, interval).await,
        };

        match result {
            Ok(series) => return Ok(series),
            Err(DataError::NotFound(reason)) => {
                debug!(%dataset, %interval, %reason, "No data, caching as empty");
                return Ok(CanonicalSeries::default());
            }
            Err(e) if e.is_retryable() && attempt < config.retry_limit => {
                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| backoff_delay(config, attempt));
                attempt += 1;
                warn!(
                    provider = provider.name(),
                    %interval,
                    error = %e,
                    attempt,
                    "Fetch failed, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(DataError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
