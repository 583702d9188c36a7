//! Cluster engine
//!
//! Translates single logical operations into parallel scatter-gather over
//! a drive set and reduces the per-drive results into a quorum answer.
//! Drive failures are hidden behind rate-limited reconnection; redundancy
//! is provided by replication or erasure coding.

mod admin;
mod cluster;
mod connection;
mod map;

pub use admin::{AdminCluster, KeyCounts};
pub use cluster::{ClusterApi, Redundancy, StripeCluster};
pub use connection::AutoConnection;
pub use map::ClusterMap;
