//! Common types for stripeio
//!
//! This crate contains the error type, core value types, version tags,
//! checksum helpers and the JSON configuration shared by all stripeio
//! components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod handler;
pub mod types;
pub mod version;

pub use config::{Config, DriveInfo, EngineConfig};
pub use error::{Error, Result};
pub use handler::BackgroundHandler;
pub use types::{
    block_key, ClusterInstanceInfo, ClusterLimits, ClusterSize, DriveEndpoint, LogType,
    PersistMode, RedundancyMode, WriteMode,
};
