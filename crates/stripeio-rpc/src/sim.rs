//! In-memory simulator drive.
//!
//! Implements the full [`DriveClient`] surface against a `BTreeMap` with
//! per-drive online/offline control, standing in for real hardware in the
//! test suites. An offline drive refuses new sessions and fails in-flight
//! operations with a transport error, which is exactly what the cluster
//! engine needs to exercise its failure handling.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use stripeio_common::{DriveEndpoint, LogType, PersistMode, WriteMode};

use crate::client::{
    DriveCapacity, DriveClient, DriveConnector, DriveLimits, DriveLog, DriveRecord, RpcError,
    RpcResult,
};

struct DriveState {
    online: bool,
    store: BTreeMap<Bytes, DriveRecord>,
}

/// One simulated drive.
pub struct SimDrive {
    limits: DriveLimits,
    nominal_bytes: u64,
    state: Mutex<DriveState>,
}

impl SimDrive {
    pub fn new(max_value_size: usize) -> Self {
        Self {
            limits: DriveLimits {
                max_key_size: 4096,
                max_value_size,
                max_version_size: 64,
            },
            nominal_bytes: 8 * 1024 * 1024 * 1024,
            state: Mutex::new(DriveState {
                online: true,
                store: BTreeMap::new(),
            }),
        }
    }

    /// Stop the drive: new sessions and in-flight operations fail.
    pub fn stop(&self) {
        self.state.lock().online = false;
    }

    /// Restart the drive; stored records survive the outage.
    pub fn start(&self) {
        self.state.lock().online = true;
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    /// Number of records currently stored.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Flip one byte of a stored value without touching its tag, so the
    /// blob fails CRC verification on the next read.
    pub fn corrupt_value(&self, key: &[u8]) -> bool {
        let mut state = self.state.lock();
        if let Some(record) = state.store.get_mut(key) {
            if record.value.is_empty() {
                return false;
            }
            let mut value = record.value.to_vec();
            value[0] ^= 0xFF;
            record.value = Bytes::from(value);
            return true;
        }
        false
    }

    /// Drop a stored record behind the engine's back (stale-blob setup).
    pub fn discard_record(&self, key: &[u8]) -> bool {
        self.state.lock().store.remove(key).is_some()
    }

    fn check_online(state: &DriveState) -> RpcResult<()> {
        if state.online {
            Ok(())
        } else {
            Err(RpcError::io("drive is offline"))
        }
    }

    fn check_version(stored: Option<&DriveRecord>, expected: &[u8], mode: WriteMode) -> RpcResult<()> {
        if mode == WriteMode::IgnoreVersion {
            return Ok(());
        }
        let current: &[u8] = stored.map(|r| r.version.as_ref()).unwrap_or(b"");
        if current == expected {
            Ok(())
        } else {
            Err(RpcError::version_mismatch("stored version differs"))
        }
    }
}

#[async_trait]
impl DriveClient for SimDrive {
    async fn get(&self, key: &[u8]) -> RpcResult<DriveRecord> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        state
            .store
            .get(key)
            .cloned()
            .ok_or_else(|| RpcError::not_found("no such key"))
    }

    async fn get_version(&self, key: &[u8]) -> RpcResult<Bytes> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        state
            .store
            .get(key)
            .map(|r| r.version.clone())
            .ok_or_else(|| RpcError::not_found("no such key"))
    }

    async fn put(
        &self,
        key: &[u8],
        expected_version: &[u8],
        record: DriveRecord,
        write_mode: WriteMode,
        _persist_mode: PersistMode,
    ) -> RpcResult<()> {
        // The in-memory store is always "persisted"; every persist mode
        // acknowledges the same way.
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if record.value.len() > self.limits.max_value_size {
            return Err(RpcError::io("value exceeds drive limit"));
        }
        Self::check_version(state.store.get(key), expected_version, write_mode)?;
        state.store.insert(Bytes::copy_from_slice(key), record);
        Ok(())
    }

    async fn delete(&self, key: &[u8], expected_version: &[u8], mode: WriteMode) -> RpcResult<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let stored = state.store.get(key);
        if stored.is_none() {
            return Err(RpcError::not_found("no such key"));
        }
        Self::check_version(stored, expected_version, mode)?;
        state.store.remove(key);
        Ok(())
    }

    async fn get_key_range(
        &self,
        start: &[u8],
        end: &[u8],
        max_results: usize,
    ) -> RpcResult<Vec<Bytes>> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        Ok(state
            .store
            .range(Bytes::copy_from_slice(start)..=Bytes::copy_from_slice(end))
            .take(max_results)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get_log(&self, types: &[LogType]) -> RpcResult<DriveLog> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        let mut log = DriveLog::default();
        if types.contains(&LogType::Limits) {
            log.limits = Some(self.limits);
        }
        if types.contains(&LogType::Capacities) {
            let used: u64 = state.store.values().map(|r| r.value.len() as u64).sum();
            log.capacity = Some(DriveCapacity {
                nominal_bytes: self.nominal_bytes,
                portion_full: used as f64 / self.nominal_bytes as f64,
            });
        }
        Ok(log)
    }

    async fn no_op(&self) -> RpcResult<()> {
        let state = self.state.lock();
        Self::check_online(&state)
    }
}

/// Connector resolving endpoint addresses to simulated drives.
pub struct SimConnector {
    drives: Mutex<HashMap<String, Arc<SimDrive>>>,
}

impl SimConnector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            drives: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, address: impl Into<String>, drive: Arc<SimDrive>) {
        self.drives.lock().insert(address.into(), drive);
    }
}

impl Default for SimConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriveConnector for SimConnector {
    async fn connect(&self, endpoint: &DriveEndpoint) -> RpcResult<Arc<dyn DriveClient>> {
        let drive = self
            .drives
            .lock()
            .get(&endpoint.address())
            .cloned()
            .ok_or_else(|| RpcError::connection(format!("no route to {}", endpoint.address())))?;
        if !drive.is_online() {
            return Err(RpcError::connection(format!(
                "{} refused the session",
                endpoint.address()
            )));
        }
        Ok(drive)
    }
}

/// Build `count` online drives plus a connector that routes to them.
///
/// Returns the connector, one endpoint per drive and the drive handles for
/// failure injection.
pub fn sim_fleet(
    count: usize,
    max_value_size: usize,
) -> (Arc<SimConnector>, Vec<DriveEndpoint>, Vec<Arc<SimDrive>>) {
    let connector = Arc::new(SimConnector::new());
    let mut endpoints = Vec::with_capacity(count);
    let mut drives = Vec::with_capacity(count);
    for i in 0..count {
        let drive = Arc::new(SimDrive::new(max_value_size));
        let endpoint = DriveEndpoint {
            host: format!("sim-{i}"),
            port: 8123,
            identity: "test".into(),
            secret: "secret".into(),
        };
        connector.register(endpoint.address(), Arc::clone(&drive));
        endpoints.push(endpoint);
        drives.push(drive);
    }
    (connector, endpoints, drives)
}
