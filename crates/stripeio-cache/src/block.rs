//! In-memory data block.
//!
//! Holds one stripe-sized region of a file together with the last known
//! cluster version. Reads validate freshness against the cluster inside a
//! short expiration window; writes are journaled as `(offset, length)`
//! updates so they can be re-merged onto a fresh remote copy when an
//! optimistic flush loses the race.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use stripeio_cluster::ClusterApi;
use stripeio_common::{Error, Result};

/// Time window within which the in-memory value is trusted without a
/// version check against the cluster.
const EXPIRATION: Duration = Duration::from_millis(1000);

/// Version-mismatch retries before a flush gives up.
const FLUSH_RETRY_LIMIT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockMode {
    /// The key is assumed to exist on the cluster.
    Standard,
    /// No server-side key is expected yet; the block is dirty from birth.
    Create,
}

struct BlockInner {
    cluster: Arc<dyn ClusterApi>,
    key: Bytes,
    mode: BlockMode,
    version: Option<Bytes>,
    value: Vec<u8>,
    /// Logical size; the buffer over-allocates to capacity on first write.
    value_size: usize,
    /// Last moment `value` was known to equal the cluster copy.
    verified_at: Option<Instant>,
    /// Local mutations as (offset, length); length zero is a truncate.
    updates: Vec<(usize, usize)>,
}

pub struct DataBlock {
    capacity: AtomicUsize,
    dirty: AtomicBool,
    inner: tokio::sync::Mutex<BlockInner>,
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlock")
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataBlock {
    pub fn new(cluster: Arc<dyn ClusterApi>, key: Bytes, mode: BlockMode) -> Self {
        let capacity = cluster.limits().max_value_size;
        Self {
            capacity: AtomicUsize::new(capacity),
            dirty: AtomicBool::new(mode == BlockMode::Create),
            inner: tokio::sync::Mutex::new(BlockInner {
                cluster,
                key,
                mode,
                version: None,
                value: Vec::new(),
                value_size: 0,
                verified_at: None,
                updates: Vec::new(),
            }),
        }
    }

    /// Bytes this block accounts for in the cache.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Whether the block holds changes the cluster has not seen. Readable
    /// without the block mutex so eviction scans stay cheap.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Recycle the block for a new key, dropping all local state but
    /// keeping the allocated buffer.
    pub async fn reassign(&self, cluster: Arc<dyn ClusterApi>, key: Bytes, mode: BlockMode) {
        let mut inner = self.inner.lock().await;
        self.capacity
            .store(cluster.limits().max_value_size, Ordering::Release);
        inner.cluster = cluster;
        inner.key = key;
        inner.mode = mode;
        inner.version = None;
        inner.value_size = 0;
        inner.verified_at = None;
        inner.updates.clear();
        self.dirty.store(mode == BlockMode::Create, Ordering::Release);
    }

    /// Read `buf.len()` bytes starting at `offset`. Regions beyond the
    /// block's logical size read as zeros.
    pub async fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_bounds(offset, buf.len())?;

        if !Self::validate_version(&mut inner).await? {
            Self::fetch_remote(&mut inner).await?;
            self.refresh_dirty(&inner);
        }

        if offset + buf.len() > inner.value_size {
            buf.fill(0);
        }
        if inner.value_size > offset {
            let copy_len = buf.len().min(inner.value_size - offset);
            buf[..copy_len].copy_from_slice(&inner.value[offset..offset + copy_len]);
        }
        Ok(())
    }

    /// Write `data` at `offset` and journal the mutation.
    pub async fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_bounds(offset, data.len())?;

        inner.value_size = inner.value_size.max(offset + data.len());

        // Allocate straight to capacity so repeated writes do not resize
        // the buffer over and over.
        if inner.value.len() < inner.value_size {
            let capacity = self.capacity();
            inner.value.resize(capacity, 0);
        }

        inner.value[offset..offset + data.len()].copy_from_slice(data);
        inner.updates.push((offset, data.len()));
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Cut the block down to `offset` bytes.
    pub async fn truncate(&self, offset: usize) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_bounds(offset, 0)?;
        inner.value_size = offset;
        inner.updates.push((offset, 0));
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Current logical size, validated against the cluster.
    pub async fn size(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if !Self::validate_version(&mut inner).await? {
            Self::fetch_remote(&mut inner).await?;
            self.refresh_dirty(&inner);
        }
        Ok(inner.value_size)
    }

    /// Write the block back to the cluster.
    ///
    /// A concurrent writer makes the optimistic put fail with a version
    /// mismatch; the block then re-reads the remote value, re-merges its
    /// local updates and retries, up to a bounded number of attempts.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.value.len() != inner.value_size {
            let size = inner.value_size;
            inner.value.resize(size, 0);
        }

        for attempt in 1.. {
            let result = {
                let BlockInner {
                    cluster,
                    key,
                    version,
                    value,
                    value_size,
                    ..
                } = &*inner;
                cluster
                    .put(key, version.as_ref(), &value[..*value_size], false)
                    .await
            };
            match result {
                Ok(new_version) => {
                    inner.version = Some(new_version);
                    inner.updates.clear();
                    inner.verified_at = Some(Instant::now());
                    self.refresh_dirty(&inner);
                    return Ok(());
                }
                Err(Error::VersionMismatch(_)) if attempt < FLUSH_RETRY_LIMIT => {
                    debug!("optimistic flush lost the race, re-merging (attempt {attempt})");
                    Self::fetch_remote(&mut inner).await?;
                }
                Err(Error::VersionMismatch(_)) => {
                    return Err(Error::Io(format!(
                        "flush failed {FLUSH_RETRY_LIMIT} times on version mismatch"
                    )));
                }
                Err(e) => {
                    return Err(Error::Io(format!(
                        "flushing block to cluster failed: {e}"
                    )));
                }
            }
        }
        unreachable!("flush loop exits through put result handling");
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.capacity() {
            return Err(Error::invalid_argument(
                "access past cluster value size limit",
            ));
        }
        Ok(())
    }

    fn refresh_dirty(&self, inner: &BlockInner) {
        let dirty =
            !inner.updates.is_empty() || (inner.version.is_none() && inner.mode == BlockMode::Create);
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Check whether the in-memory value may be used without a fetch.
    async fn validate_version(inner: &mut BlockInner) -> Result<bool> {
        if inner
            .verified_at
            .is_some_and(|t| t.elapsed() < EXPIRATION)
        {
            return Ok(true);
        }

        // First read of a block opened in standard mode: skip the version
        // probe and go straight to the value fetch.
        if inner.version.is_none() && inner.mode == BlockMode::Standard {
            return Ok(false);
        }

        match inner.cluster.get_version(&inner.key).await {
            Ok(remote_version) => {
                if inner.version.as_ref() == Some(&remote_version) {
                    inner.verified_at = Some(Instant::now());
                    return Ok(true);
                }
            }
            Err(e) if e.is_not_found() => {
                // Never flushed; the key not existing on the cluster is
                // the expected state.
                if inner.version.is_none() {
                    inner.verified_at = Some(Instant::now());
                    return Ok(true);
                }
            }
            Err(e) => return Err(Error::Io(format!("validating block version failed: {e}"))),
        }
        Ok(false)
    }

    /// Fetch the cluster copy and re-merge all journaled local updates
    /// onto it.
    async fn fetch_remote(inner: &mut BlockInner) -> Result<()> {
        let remote_value = match inner.cluster.get(&inner.key).await {
            Ok((value, version)) => {
                inner.version = Some(version);
                value
            }
            Err(e) if e.is_not_found() => {
                inner.version = None;
                Bytes::new()
            }
            Err(e) => {
                return Err(Error::Io(format!(
                    "reading block from cluster failed: {e}"
                )))
            }
        };

        let mut merged = remote_value.to_vec();
        inner.value_size = merged.len();

        if !inner.updates.is_empty() && merged.len() < inner.value.len() {
            merged.resize(inner.value.len(), 0);
        }

        // Replay the journal in order. The replay copies the recorded
        // ranges out of the previous local buffer, which holds those bytes
        // at the same offsets unless a flush shrank it after a truncate;
        // the copy is clamped to what the buffer still holds.
        for &(offset, length) in &inner.updates {
            if length == 0 {
                inner.value_size = offset;
            } else {
                inner.value_size = inner.value_size.max(offset + length);
                let end = (offset + length).min(inner.value.len());
                if offset < end {
                    merged[offset..end].copy_from_slice(&inner.value[offset..end]);
                }
            }
        }
        if merged.len() < inner.value_size {
            merged.resize(inner.value_size, 0);
        }
        inner.value = merged;
        inner.verified_at = Some(Instant::now());
        Ok(())
    }
}
