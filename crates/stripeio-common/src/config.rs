//! JSON configuration.
//!
//! Three documents describe the deployment: drive locations, drive
//! security and the cluster definition. Each is supplied through an
//! environment slot (`DRIVE_LOCATION`, `DRIVE_SECURITY`,
//! `CLUSTER_DEFINITION`) that holds either the inline JSON document or a
//! path to a file containing it.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ClusterInstanceInfo, DriveEndpoint};

/// Environment slot holding the drive location document.
pub const ENV_DRIVE_LOCATION: &str = "DRIVE_LOCATION";
/// Environment slot holding the drive security document.
pub const ENV_DRIVE_SECURITY: &str = "DRIVE_SECURITY";
/// Environment slot holding the cluster definition document.
pub const ENV_CLUSTER_DEFINITION: &str = "CLUSTER_DEFINITION";

/// Engine-wide tunables from the `configuration` section.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Hard cache capacity in bytes.
    pub cache_capacity: usize,
    /// Maximum number of blocks prefetched per readahead decision.
    pub readahead_window: usize,
    /// Worker limit of the shared background handler.
    pub background_threads: usize,
    /// Queue depth of the shared background handler (0 = no-queue mode).
    pub background_queue_depth: usize,
}

impl EngineConfig {
    /// Preferred cache size the eviction scan steers towards.
    ///
    /// The configuration documents carry only the hard capacity; the
    /// target sits at 70% so the pressure window of the throttle is
    /// non-empty.
    #[must_use]
    pub fn cache_target(&self) -> usize {
        self.cache_capacity / 10 * 7
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256 * 1024 * 1024,
            readahead_window: 8,
            background_threads: 4,
            background_queue_depth: 16,
        }
    }
}

/// Both endpoints of a drive, credentials merged in.
#[derive(Clone, Debug)]
pub struct DriveInfo {
    pub wwn: String,
    pub primary: DriveEndpoint,
    pub secondary: DriveEndpoint,
}

/// Fully merged configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub drives: HashMap<String, DriveInfo>,
    pub clusters: HashMap<String, ClusterInstanceInfo>,
    pub engine: EngineConfig,
}

#[derive(Deserialize)]
struct LocationDoc {
    location: Vec<LocationEntry>,
}

#[derive(Deserialize)]
struct LocationEntry {
    wwn: String,
    interfaces: Vec<InterfaceEntry>,
}

#[derive(Deserialize)]
struct InterfaceEntry {
    #[allow(dead_code)]
    name: String,
    ip: String,
    port: u16,
}

#[derive(Deserialize)]
struct SecurityDoc {
    security: Vec<SecurityEntry>,
}

#[derive(Deserialize)]
struct SecurityEntry {
    wwn: String,
    identity: String,
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterDoc {
    cluster: Vec<ClusterEntry>,
    #[serde(default)]
    configuration: Option<EngineConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterEntry {
    id: String,
    num_data: usize,
    num_parity: usize,
    block_size: usize,
    min_reconnect_interval: u64,
    operation_timeout: u64,
    drives: Vec<String>,
}

impl Config {
    /// Load from the three environment slots.
    pub fn from_env() -> Result<Self> {
        let location = read_slot(ENV_DRIVE_LOCATION)?;
        let security = read_slot(ENV_DRIVE_SECURITY)?;
        let cluster = read_slot(ENV_CLUSTER_DEFINITION)?;
        Self::from_documents(&location, &security, &cluster)
    }

    /// Parse and merge the three JSON documents.
    pub fn from_documents(location: &str, security: &str, cluster: &str) -> Result<Self> {
        let location: LocationDoc = serde_json::from_str(location)
            .map_err(|e| Error::invalid_argument(format!("drive location document: {e}")))?;
        let security: SecurityDoc = serde_json::from_str(security)
            .map_err(|e| Error::invalid_argument(format!("drive security document: {e}")))?;
        let cluster: ClusterDoc = serde_json::from_str(cluster)
            .map_err(|e| Error::invalid_argument(format!("cluster definition document: {e}")))?;

        let credentials: HashMap<&str, &SecurityEntry> = security
            .security
            .iter()
            .map(|s| (s.wwn.as_str(), s))
            .collect();

        let mut drives = HashMap::new();
        for entry in &location.location {
            let sec = credentials.get(entry.wwn.as_str()).ok_or_else(|| {
                Error::invalid_argument(format!("no security entry for drive {}", entry.wwn))
            })?;
            if entry.interfaces.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "drive {} has no interfaces",
                    entry.wwn
                )));
            }
            let endpoint = |i: &InterfaceEntry| DriveEndpoint {
                host: i.ip.clone(),
                port: i.port,
                identity: sec.identity.clone(),
                secret: sec.key.clone(),
            };
            // Interfaces are prioritized by position; a single-homed drive
            // reuses its only interface as the secondary.
            let primary = endpoint(&entry.interfaces[0]);
            let secondary = entry
                .interfaces
                .get(1)
                .map(endpoint)
                .unwrap_or_else(|| primary.clone());
            drives.insert(
                entry.wwn.clone(),
                DriveInfo {
                    wwn: entry.wwn.clone(),
                    primary,
                    secondary,
                },
            );
        }

        let mut clusters = HashMap::new();
        for entry in cluster.cluster {
            for wwn in &entry.drives {
                if !drives.contains_key(wwn) {
                    return Err(Error::invalid_argument(format!(
                        "cluster {} references unknown drive {wwn}",
                        entry.id
                    )));
                }
            }
            if entry.num_data + entry.num_parity > entry.drives.len() {
                return Err(Error::invalid_argument(format!(
                    "cluster {}: stripe width {} exceeds drive count {}",
                    entry.id,
                    entry.num_data + entry.num_parity,
                    entry.drives.len()
                )));
            }
            clusters.insert(
                entry.id.clone(),
                ClusterInstanceInfo {
                    id: entry.id,
                    num_data: entry.num_data,
                    num_parity: entry.num_parity,
                    block_size: entry.block_size,
                    reconnect_interval: Duration::from_secs(entry.min_reconnect_interval),
                    operation_timeout: Duration::from_secs(entry.operation_timeout),
                    drives: entry.drives,
                },
            );
        }

        Ok(Self {
            drives,
            clusters,
            engine: cluster.configuration.unwrap_or_default(),
        })
    }
}

/// Resolve one environment slot: inline JSON or a path to a JSON file.
fn read_slot(name: &str) -> Result<String> {
    let value = std::env::var(name)
        .map_err(|_| Error::invalid_argument(format!("environment slot {name} is not set")))?;
    if value.trim_start().starts_with(['{', '[']) {
        return Ok(value);
    }
    std::fs::read_to_string(&value)
        .map_err(|e| Error::invalid_argument(format!("reading {name} from {value}: {e}")))
}
