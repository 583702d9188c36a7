//! Key-space health operations.
//!
//! The admin cluster assesses drives individually instead of hiding them
//! behind quorum: a key whose stripe is only partially present is found by
//! probing every stripe drive for its version of the key.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use stripeio_common::Result;
use stripeio_rpc::StatusCode;

use crate::cluster::{ClusterApi, StripeCluster};

/// Aggregated outcome of the last scan/repair/reset walk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyCounts {
    /// Keys visited.
    pub total: usize,
    /// Keys whose stripe cannot be assessed because drives are unreachable.
    pub incomplete: usize,
    /// Keys with missing or stale blobs that a repair can fix.
    pub need_action: usize,
    /// Keys re-striped by `repair`.
    pub repaired: usize,
    /// Keys deleted by `reset`.
    pub removed: usize,
    /// Keys with fewer than `num_data` conforming blobs.
    pub unrepairable: usize,
}

enum KeyHealth {
    Healthy,
    Incomplete,
    NeedAction,
    Unrepairable,
}

pub struct AdminCluster {
    cluster: Arc<StripeCluster>,
    counts: Mutex<KeyCounts>,
}

impl AdminCluster {
    pub fn new(cluster: Arc<StripeCluster>) -> Self {
        Self {
            cluster,
            counts: Mutex::new(KeyCounts::default()),
        }
    }

    /// The cluster handle the admin operates on.
    #[must_use]
    pub fn cluster(&self) -> &Arc<StripeCluster> {
        &self.cluster
    }

    /// Counts gathered by the most recent operation.
    #[must_use]
    pub fn counts(&self) -> KeyCounts {
        *self.counts.lock()
    }

    /// Walk the key space and classify every key. Returns the number of
    /// keys visited.
    pub async fn scan(&self, max_keys: usize) -> Result<usize> {
        let keys = self.keys(max_keys).await?;
        let mut counts = KeyCounts {
            total: keys.len(),
            ..KeyCounts::default()
        };
        for key in &keys {
            match self.assess(key).await {
                KeyHealth::Healthy => {}
                KeyHealth::Incomplete => counts.incomplete += 1,
                KeyHealth::NeedAction => counts.need_action += 1,
                KeyHealth::Unrepairable => counts.unrepairable += 1,
            }
        }
        *self.counts.lock() = counts;
        Ok(counts.total)
    }

    /// Re-stripe every key with missing or stale blobs by reading it back
    /// through quorum and rewriting the full stripe.
    pub async fn repair(&self, max_keys: usize) -> Result<usize> {
        let keys = self.keys(max_keys).await?;
        let mut counts = KeyCounts {
            total: keys.len(),
            ..KeyCounts::default()
        };
        for key in &keys {
            match self.assess(key).await {
                KeyHealth::Healthy => {}
                KeyHealth::Incomplete => counts.incomplete += 1,
                KeyHealth::Unrepairable => counts.unrepairable += 1,
                KeyHealth::NeedAction => match self.rewrite(key).await {
                    Ok(()) => counts.repaired += 1,
                    Err(e) => {
                        warn!("repair of key failed: {e}");
                        counts.unrepairable += 1;
                    }
                },
            }
        }
        *self.counts.lock() = counts;
        info!(
            repaired = counts.repaired,
            unrepairable = counts.unrepairable,
            "repair walk finished"
        );
        Ok(counts.total)
    }

    /// Destructively remove every scanned key.
    pub async fn reset(&self, max_keys: usize) -> Result<usize> {
        let keys = self.keys(max_keys).await?;
        let mut counts = KeyCounts {
            total: keys.len(),
            ..KeyCounts::default()
        };
        for key in &keys {
            match self.cluster.remove(key, None, true).await {
                Ok(()) => counts.removed += 1,
                Err(e) => warn!("reset of key failed: {e}"),
            }
        }
        *self.counts.lock() = counts;
        Ok(counts.total)
    }

    /// Union of the key ranges of every drive. Unreachable drives are
    /// skipped; their keys surface once the drive is back.
    async fn keys(&self, max_keys: usize) -> Result<Vec<Bytes>> {
        let indices = self.cluster.all_indices();
        let start = Bytes::new();
        let end = Bytes::from(vec![0xFFu8; 64]);
        let results = self
            .cluster
            .scatter(&indices, |_, client| {
                let start = start.clone();
                let end = end.clone();
                async move { client.get_key_range(&start, &end, max_keys).await }
            })
            .await;

        let mut merged = BTreeSet::new();
        for keys in results.iter().flatten() {
            merged.extend(keys.iter().cloned());
        }
        Ok(merged.into_iter().take(max_keys).collect())
    }

    async fn assess(&self, key: &Bytes) -> KeyHealth {
        let indices = self.cluster.stripe_indices(key);
        let results = self
            .cluster
            .scatter(&indices, |_, client| {
                let key = key.clone();
                async move { client.get_version(&key).await }
            })
            .await;

        let unreachable = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(e) if e.code == StatusCode::RemoteConnectionError
                        || e.code == StatusCode::ClientIo
                )
            })
            .count();

        let versions: Vec<&Bytes> = results.iter().flatten().collect();
        let conforming = versions
            .iter()
            .map(|candidate| versions.iter().filter(|v| ***v == **candidate).count())
            .max()
            .unwrap_or(0);

        if conforming == indices.len() {
            KeyHealth::Healthy
        } else if unreachable > 0 {
            KeyHealth::Incomplete
        } else if conforming >= self.cluster.num_data() {
            KeyHealth::NeedAction
        } else {
            KeyHealth::Unrepairable
        }
    }

    async fn rewrite(&self, key: &Bytes) -> Result<()> {
        let (value, version) = self.cluster.get(key).await?;
        self.cluster.put(key, Some(&version), &value, true).await?;
        Ok(())
    }
}
