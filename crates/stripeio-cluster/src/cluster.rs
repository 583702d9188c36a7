//! Quorum cluster engine.
//!
//! A logical operation is executed as one sub-operation per targeted
//! drive; the per-drive statuses are reduced into a quorum answer. Values
//! are striped per the cluster's redundancy mode: replication stores the
//! full value on every stripe drive, erasure coding chunks it and adds
//! Reed-Solomon parity shards.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use stripeio_common::{
    checksum, version, ClusterLimits, ClusterSize, DriveEndpoint, Error, LogType, PersistMode,
    RedundancyMode, Result, WriteMode,
};
use stripeio_erasure::{ErasureError, StripeCodec};
use stripeio_rpc::{
    status_of, DriveClient, DriveConnector, DriveLog, DriveRecord, RpcError, RpcResult, StatusCode,
};

use crate::connection::AutoConnection;

/// Capability surface of a cluster, consumed by the block and cache
/// layers. Implemented by [`StripeCluster`] and by test mocks.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn id(&self) -> &str;

    fn limits(&self) -> ClusterLimits;

    async fn size(&self) -> Result<ClusterSize>;

    /// Version-only read (the `skip_value` fast path).
    async fn get_version(&self, key: &Bytes) -> Result<Bytes>;

    /// Full read; returns the value and its version.
    async fn get(&self, key: &Bytes) -> Result<(Bytes, Bytes)>;

    /// Optimistic write; returns the freshly generated version.
    async fn put(
        &self,
        key: &Bytes,
        expected_version: Option<&Bytes>,
        value: &[u8],
        force: bool,
    ) -> Result<Bytes>;

    async fn remove(&self, key: &Bytes, version: Option<&Bytes>, force: bool) -> Result<()>;

    async fn range(&self, start: &Bytes, end: &Bytes, max_results: usize) -> Result<Vec<Bytes>>;
}

/// Redundancy scheme of one cluster instance.
#[derive(Debug)]
pub enum Redundancy {
    Replication,
    Erasure(StripeCodec),
}

struct SizeState {
    last: Mutex<(Result<()>, ClusterSize)>,
    refresh_in_flight: AtomicBool,
}

pub struct StripeCluster {
    id: String,
    num_data: usize,
    num_parity: usize,
    connections: Arc<Vec<Arc<AutoConnection>>>,
    op_timeout: Duration,
    redundancy: Redundancy,
    limits: ClusterLimits,
    size_state: Arc<SizeState>,
}

impl std::fmt::Debug for StripeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeCluster")
            .field("id", &self.id)
            .field("num_data", &self.num_data)
            .field("num_parity", &self.num_parity)
            .field("op_timeout", &self.op_timeout)
            .field("redundancy", &self.redundancy)
            .field("limits", &self.limits)
            .finish()
    }
}

impl StripeCluster {
    /// Build a cluster instance and fetch its limits from the drives.
    ///
    /// Fails when the stripe does not fit the drive set or the initial
    /// log fetch cannot reach quorum.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        id: impl Into<String>,
        num_data: usize,
        num_parity: usize,
        endpoints: Vec<(DriveEndpoint, DriveEndpoint)>,
        mode: RedundancyMode,
        reconnect_interval: Duration,
        op_timeout: Duration,
        connector: Arc<dyn DriveConnector>,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        if num_data == 0 {
            return Err(Error::invalid_argument("cluster needs at least one data blob"));
        }
        if num_data + num_parity > endpoints.len() {
            return Err(Error::invalid_argument(
                "stripe size plus parity size cannot exceed cluster size",
            ));
        }

        let redundancy = match mode {
            RedundancyMode::Replication => Redundancy::Replication,
            RedundancyMode::Erasure => Redundancy::Erasure(StripeCodec::new(num_data, num_parity)?),
        };

        let connections: Arc<Vec<Arc<AutoConnection>>> = Arc::new(
            endpoints
                .into_iter()
                .map(|(primary, secondary)| {
                    AutoConnection::new(Arc::clone(&connector), primary, secondary, reconnect_interval)
                })
                .collect(),
        );

        let results = gather_log(
            &connections,
            op_timeout,
            &[LogType::Limits, LogType::Capacities],
        )
        .await;
        reduce(num_data, num_parity, &results)
            .map_err(|e| Error::Connection(format!("initial log fetch failed: {e}")))?;
        let (drive_limits, size) = aggregate_log(&results);
        let mut limits = ClusterLimits {
            max_key_size: drive_limits.max_key_size,
            max_value_size: drive_limits.max_value_size,
            max_version_size: drive_limits.max_version_size,
        };

        // The engine concatenates `num_data` shards into one value.
        if matches!(redundancy, Redundancy::Erasure(_)) {
            limits.max_value_size *= num_data;
        }

        Ok(Arc::new(Self {
            id,
            num_data,
            num_parity,
            connections,
            op_timeout,
            redundancy,
            limits,
            size_state: Arc::new(SizeState {
                last: Mutex::new((Ok(()), size)),
                refresh_in_flight: AtomicBool::new(false),
            }),
        }))
    }

    pub(crate) fn num_data(&self) -> usize {
        self.num_data
    }

    pub(crate) fn stripe_width(&self) -> usize {
        self.num_data + self.num_parity
    }

    /// Deterministic stripe placement: same key, same drive order.
    pub(crate) fn stripe_indices(&self, key: &[u8]) -> Vec<usize> {
        let start = crc32c::crc32c(key) as usize % self.connections.len();
        (0..self.stripe_width())
            .map(|i| (start + i) % self.connections.len())
            .collect()
    }

    pub(crate) fn all_indices(&self) -> Vec<usize> {
        (0..self.connections.len()).collect()
    }

    /// One sub-operation per target drive, executed in parallel under the
    /// operation timeout. Results are positional: slot `i` belongs to
    /// target `indices[i]`. Connection acquisition failures synthesize a
    /// connection-error result; transport failures and timeouts mark the
    /// connection for reconnection.
    pub(crate) async fn scatter<T, F, Fut>(&self, indices: &[usize], op: F) -> Vec<RpcResult<T>>
    where
        F: Fn(usize, Arc<dyn DriveClient>) -> Fut + Sync,
        Fut: Future<Output = RpcResult<T>> + Send,
        T: Send,
    {
        scatter_over(&self.connections, self.op_timeout, indices, op).await
    }

    pub(crate) fn reduce<T>(&self, results: &[RpcResult<T>]) -> Result<()> {
        reduce(self.num_data, self.num_parity, results)
    }

    fn encode_stripe(&self, value: &[u8]) -> Result<Vec<Bytes>> {
        // An empty value writes empty blobs everywhere; running the codec
        // over it would treat every shard as missing.
        if value.is_empty() {
            return Ok(vec![Bytes::new(); self.stripe_width()]);
        }
        match &self.redundancy {
            Redundancy::Replication => {
                Ok(vec![Bytes::copy_from_slice(value); self.stripe_width()])
            }
            Redundancy::Erasure(codec) => Ok(codec
                .encode(value)?
                .into_iter()
                .map(Bytes::from)
                .collect()),
        }
    }

    fn decode_stripe(&self, shards: Vec<Option<Vec<u8>>>, value_size: usize) -> Result<Bytes> {
        match &self.redundancy {
            Redundancy::Replication => {
                let mut copy = shards
                    .into_iter()
                    .flatten()
                    .next()
                    .ok_or_else(|| Error::Unreadable("no intact copy survived".into()))?;
                copy.truncate(value_size);
                Ok(Bytes::from(copy))
            }
            Redundancy::Erasure(codec) => match codec.decode(&shards, value_size) {
                Ok(value) => Ok(Bytes::from(value)),
                Err(ErasureError::InsufficientShards { available, required }) => {
                    Err(Error::Unreadable(format!(
                        "{available} intact blobs cannot satisfy read quorum of {required}"
                    )))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Most frequent version among successful responses.
    fn version_quorum<'a, I>(&self, versions: I) -> Result<Bytes>
    where
        I: Iterator<Item = &'a Bytes>,
    {
        let versions: Vec<&Bytes> = versions.collect();
        let mut best: Option<(&Bytes, usize)> = None;
        for &candidate in &versions {
            let count = versions.iter().filter(|v| ***v == *candidate).count();
            if best.map_or(true, |(_, n)| count > n) {
                best = Some((candidate, count));
            }
        }
        match best {
            Some((version, count)) if count >= self.num_data => Ok(version.clone()),
            Some((_, count)) => Err(Error::Unreadable(format!(
                "{count} equal versions does not reach read quorum of {}",
                self.num_data
            ))),
            None => Err(Error::Unreadable(
                "no version responses from drives".into(),
            )),
        }
    }

    fn spawn_size_refresh(&self) {
        if self.size_state.refresh_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections = Arc::clone(&self.connections);
        let state = Arc::clone(&self.size_state);
        let (num_data, num_parity, op_timeout) = (self.num_data, self.num_parity, self.op_timeout);
        tokio::spawn(async move {
            let results = gather_log(&connections, op_timeout, &[LogType::Capacities]).await;
            let status = reduce(num_data, num_parity, &results);
            let mut last = state.last.lock();
            match status {
                Ok(()) => {
                    let (_, size) = aggregate_log(&results);
                    *last = (Ok(()), size);
                }
                Err(e) => last.0 = Err(e),
            }
            drop(last);
            state.refresh_in_flight.store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl ClusterApi for StripeCluster {
    fn id(&self) -> &str {
        &self.id
    }

    fn limits(&self) -> ClusterLimits {
        self.limits
    }

    /// Cached aggregate size. Returns the last aggregated values and, if
    /// no refresh is in flight, spawns one in the background.
    async fn size(&self) -> Result<ClusterSize> {
        self.spawn_size_refresh();
        let last = self.size_state.last.lock();
        last.0.clone()?;
        Ok(last.1)
    }

    async fn get_version(&self, key: &Bytes) -> Result<Bytes> {
        let indices = self.stripe_indices(key);
        let results = self
            .scatter(&indices, |_, client| {
                let key = key.clone();
                async move { client.get_version(&key).await }
            })
            .await;
        self.reduce(&results)?;
        self.version_quorum(results.iter().flatten())
    }

    async fn get(&self, key: &Bytes) -> Result<(Bytes, Bytes)> {
        let indices = self.stripe_indices(key);
        let results = self
            .scatter(&indices, |_, client| {
                let key = key.clone();
                async move { client.get(&key).await }
            })
            .await;
        self.reduce(&results)?;

        let target_version =
            self.version_quorum(results.iter().flatten().map(|record| &record.version))?;
        let value_size = version::decode_size(&target_version)?;
        if value_size == 0 {
            return Ok((Bytes::new(), target_version));
        }

        // Positional stripe; blobs failing CRC verification count as
        // missing and fall to the decoder.
        let shards: Vec<Option<Vec<u8>>> = results
            .iter()
            .map(|result| match result {
                Ok(record)
                    if record.version == target_version
                        && !record.value.is_empty()
                        && checksum::verify(&record.value, record.tag) =>
                {
                    Some(record.value.to_vec())
                }
                _ => None,
            })
            .collect();
        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing > 0 {
            debug!(
                cluster = %self.id,
                missing, "reconstructing stripe from surviving blobs"
            );
        }

        let value = self.decode_stripe(shards, value_size)?;
        Ok((value, target_version))
    }

    async fn put(
        &self,
        key: &Bytes,
        expected_version: Option<&Bytes>,
        value: &[u8],
        force: bool,
    ) -> Result<Bytes> {
        if value.len() > self.limits.max_value_size {
            return Err(Error::invalid_argument(
                "value exceeds cluster value size limit",
            ));
        }

        let new_version = version::generate(value.len());
        let blobs = self.encode_stripe(value)?;
        let expected = expected_version.cloned().unwrap_or_default();
        let mode = if force {
            WriteMode::IgnoreVersion
        } else {
            WriteMode::RequireSameVersion
        };

        let indices = self.stripe_indices(key);
        let results = self
            .scatter(&indices, |position, client| {
                let key = key.clone();
                let expected = expected.clone();
                let blob = blobs[position].clone();
                let record = DriveRecord {
                    tag: checksum::compute(&blob),
                    value: blob,
                    version: new_version.clone(),
                };
                async move {
                    client
                        .put(&key, &expected, record, mode, PersistMode::WriteBack)
                        .await
                }
            })
            .await;
        self.reduce(&results)?;
        Ok(new_version)
    }

    async fn remove(&self, key: &Bytes, version: Option<&Bytes>, force: bool) -> Result<()> {
        let expected = version.cloned().unwrap_or_default();
        let mode = if force {
            WriteMode::IgnoreVersion
        } else {
            WriteMode::RequireSameVersion
        };
        let indices = self.stripe_indices(key);
        let results = self
            .scatter(&indices, |_, client| {
                let key = key.clone();
                let expected = expected.clone();
                async move { client.delete(&key, &expected, mode).await }
            })
            .await;
        self.reduce(&results)
    }

    async fn range(&self, start: &Bytes, end: &Bytes, max_results: usize) -> Result<Vec<Bytes>> {
        let indices = self.stripe_indices(start);
        let results = self
            .scatter(&indices, |_, client| {
                let start = start.clone();
                let end = end.clone();
                async move { client.get_key_range(&start, &end, max_results).await }
            })
            .await;
        self.reduce(&results)?;

        let mut merged = BTreeSet::new();
        for keys in results.iter().flatten() {
            merged.extend(keys.iter().cloned());
        }
        Ok(merged.into_iter().take(max_results).collect())
    }
}

/// Shared scatter loop, usable before a cluster instance exists.
pub(crate) async fn scatter_over<T, F, Fut>(
    connections: &[Arc<AutoConnection>],
    op_timeout: Duration,
    indices: &[usize],
    op: F,
) -> Vec<RpcResult<T>>
where
    F: Fn(usize, Arc<dyn DriveClient>) -> Fut + Sync,
    Fut: Future<Output = RpcResult<T>> + Send,
    T: Send,
{
    let op = &op;
    let subops = indices.iter().enumerate().map(|(position, &index)| {
        let connection = Arc::clone(&connections[index]);
        async move {
            let client = match connection.get().await {
                Ok(client) => client,
                Err(e) => return Err(RpcError::connection(e.to_string())),
            };
            match tokio::time::timeout(op_timeout, op(position, client)).await {
                Ok(result) => {
                    if let Err(e) = &result {
                        if e.code == StatusCode::ClientIo {
                            connection.set_error().await;
                        }
                    }
                    result
                }
                Err(_) => {
                    warn!("drive operation timed out after {op_timeout:?}");
                    connection.set_error().await;
                    Err(RpcError::io("network timeout"))
                }
            }
        }
    });
    join_all(subops).await
}

/// Quorum reduction over sub-operation statuses.
///
/// The first status (in drive order) reaching `num_data` occurrences wins;
/// once a status exceeds `num_parity` without reaching quorum no other
/// status can, and the reduction fails.
pub(crate) fn reduce<T>(num_data: usize, num_parity: usize, results: &[RpcResult<T>]) -> Result<()> {
    let statuses: Vec<StatusCode> = results.iter().map(status_of).collect();
    for status in &statuses {
        let frequency = statuses.iter().filter(|s| *s == status).count();
        if frequency >= num_data {
            return status_to_result(*status);
        }
        if frequency > num_parity {
            break;
        }
    }
    Err(Error::Io(
        "failed to get sufficient conforming return results from drives".into(),
    ))
}

fn status_to_result(status: StatusCode) -> Result<()> {
    match status {
        StatusCode::Ok => Ok(()),
        StatusCode::RemoteNotFound => Err(Error::NotFound("key not found on cluster".into())),
        StatusCode::RemoteVersionMismatch => {
            Err(Error::VersionMismatch("cluster version differs".into()))
        }
        StatusCode::RemoteConnectionError => {
            Err(Error::Connection("drives unreachable".into()))
        }
        StatusCode::ClientIo => Err(Error::Io("drive transport failure".into())),
        StatusCode::ClientInternal => Err(Error::Internal("drive client failure".into())),
    }
}

pub(crate) async fn gather_log(
    connections: &[Arc<AutoConnection>],
    op_timeout: Duration,
    types: &[LogType],
) -> Vec<RpcResult<DriveLog>> {
    let indices: Vec<usize> = (0..connections.len()).collect();
    let types = types.to_vec();
    scatter_over(connections, op_timeout, &indices, |_, client| {
        let types = types.clone();
        async move { client.get_log(&types).await }
    })
    .await
}

/// Aggregate per-drive logs: capacities sum up, limits come from any
/// responding drive.
pub(crate) fn aggregate_log(results: &[RpcResult<DriveLog>]) -> (stripeio_rpc::DriveLimits, ClusterSize) {
    let mut limits = stripeio_rpc::DriveLimits::default();
    let mut size = ClusterSize::default();
    for log in results.iter().flatten() {
        if let Some(drive_limits) = log.limits {
            limits = drive_limits;
        }
        if let Some(capacity) = log.capacity {
            size.bytes_total += capacity.nominal_bytes;
            size.bytes_free += (capacity.nominal_bytes as f64 * (1.0 - capacity.portion_full))
                as u64;
        }
    }
    (limits, size)
}
