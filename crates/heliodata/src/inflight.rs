//! Claims on sub-intervals currently being fetched.
//!
//! A request registers a claim for every sub-interval it is about to fetch
//! while it holds the dataset's planning lock. Requests planning later see
//! the claim and wait for it instead of fetching the same range again.
//! Dropping the [`ClaimGuard`] releases the claim and wakes the waiters,
//! whether the fetch finished, failed or was abandoned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use heliodata_core::{DatasetId, TimeInterval};

#[derive(Debug)]
struct Claim {
    id: u64,
    interval: TimeInterval,
    released: watch::Receiver<()>,
}

/// Table of active claims, per dataset.
#[derive(Debug, Default)]
pub(crate) struct ClaimTable {
    next_id: AtomicU64,
    claims: Mutex<HashMap<DatasetId, Vec<Claim>>>,
}

/// Handle to a claim another request holds.
#[derive(Debug)]
pub(crate) struct ClaimWaiter {
    pub(crate) interval: TimeInterval,
    released: watch::Receiver<()>,
}

impl ClaimWaiter {
    /// Resolves once the claim is released.
    pub(crate) async fn released(mut self) {
        // The sender never sends; `changed` errors once it is dropped.
        let _ = self.released.changed().await;
    }
}

/// Keeps a claim registered until dropped.
#[derive(Debug)]
pub(crate) struct ClaimGuard {
    table: Arc<ClaimTable>,
    dataset: DatasetId,
    id: u64,
    _release: watch::Sender<()>,
}

impl ClaimTable {
    /// Claims that intersect `interval`.
    pub(crate) fn overlapping(
        &self,
        dataset: &DatasetId,
        interval: &TimeInterval,
    ) -> Vec<ClaimWaiter> {
        let claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims
            .get(dataset)
            .map(|active| {
                active
                    .iter()
                    .filter(|claim| claim.interval.intersects(interval))
                    .map(|claim| ClaimWaiter {
                        interval: claim.interval,
                        released: claim.released.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers a claim on `interval`.
    pub(crate) fn claim(self: &Arc<Self>, dataset: &DatasetId, interval: TimeInterval) -> ClaimGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (release, released) = watch::channel(());
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(dataset.clone())
            .or_default()
            .push(Claim {
                id,
                interval,
                released,
            });
        ClaimGuard {
            table: Arc::clone(self),
            dataset: dataset.clone(),
            id,
            _release: release,
        }
    }

    /// Number of active claims on `dataset`.
    #[cfg(test)]
    pub(crate) fn active(&self, dataset: &DatasetId) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dataset)
            .map_or(0, Vec::len)
    }

    fn release(&self, dataset: &DatasetId, id: u64) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = claims.get_mut(dataset) {
            active.retain(|claim| claim.id != id);
            if active.is_empty() {
                claims.remove(dataset);
            }
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        // Unregister first; the sender drops after this and wakes waiters.
        self.table.release(&self.dataset, self.id);
    }
}
