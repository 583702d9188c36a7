//! Core value types shared across the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redundancy scheme of a cluster instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedundancyMode {
    /// Full-value copies on every drive of the stripe.
    Replication,
    /// Reed-Solomon data + parity shards.
    Erasure,
}

/// Version handling mode of a drive write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    IgnoreVersion,
    RequireSameVersion,
}

/// Durability the drive must provide before acknowledging a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistMode {
    /// Acknowledge once the drive has the data in its write cache.
    WriteBack,
    /// Acknowledge only after the data is persisted.
    WriteThrough,
    /// Persist this write and everything queued before it.
    Flush,
}

/// Drive log categories the engine consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogType {
    Limits,
    Capacities,
}

/// Limits published by a cluster.
///
/// `max_value_size` is the drive limit multiplied by the number of data
/// shards for erasure instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterLimits {
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub max_version_size: usize,
}

/// Aggregated capacity of a cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterSize {
    pub bytes_total: u64,
    pub bytes_free: u64,
}

/// One endpoint of a drive, with access credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveEndpoint {
    pub host: String,
    pub port: u16,
    pub identity: String,
    pub secret: String,
}

impl DriveEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything required to build a cluster instance.
#[derive(Clone, Debug)]
pub struct ClusterInstanceInfo {
    pub id: String,
    pub num_data: usize,
    pub num_parity: usize,
    pub block_size: usize,
    pub reconnect_interval: Duration,
    pub operation_timeout: Duration,
    /// Unique drive ids (wwn) in stripe order.
    pub drives: Vec<String>,
}

/// Compose the drive key for one block of a file.
///
/// Blocks of a file share the basename; the suffix is zero-padded so that
/// key-range scans return blocks in numeric order.
#[must_use]
pub fn block_key(basename: &[u8], block_number: u64) -> Bytes {
    let mut key = Vec::with_capacity(basename.len() + 12);
    key.extend_from_slice(basename);
    key.extend_from_slice(format!("_{block_number:010}").as_bytes());
    Bytes::from(key)
}
