//! stripeio — client-side striped storage engine
//!
//! Presents byte-range block I/O on top of a cluster of key-addressable
//! drives. Files are striped across drives with replication or erasure
//! coding; a shared write-back cache with readahead sits in front, and
//! drive failures stay invisible behind quorum operations and automatic
//! reconnection.
//!
//! The [`Runtime`] is the single top-level value: construct it once at
//! startup and hand its cache and cluster map to the file I/O façades.
//! There are no hidden globals.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stripeio::{Config, Runtime};
//! # async fn example(connector: Arc<dyn stripeio::DriveConnector>) -> stripeio::Result<()> {
//! let runtime = Runtime::new(Config::from_env()?, connector).await?;
//! let cluster = runtime
//!     .cluster_map()
//!     .get_cluster("alpha", stripeio::RedundancyMode::Erasure)
//!     .await?;
//! let owner = runtime.cache().register_owner(cluster, &b"volumes/a"[..]);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

pub use stripeio_cache::{
    BlockMode, CacheStats, DataBlock, DataCache, OwnerId, PredictionType, PrefetchOracle,
    RequestMode,
};
pub use stripeio_cluster::{AdminCluster, AutoConnection, ClusterApi, ClusterMap, KeyCounts, StripeCluster};
pub use stripeio_common::{
    block_key, BackgroundHandler, ClusterLimits, ClusterSize, Config, EngineConfig, Error,
    RedundancyMode, Result,
};
pub use stripeio_erasure::StripeCodec;
pub use stripeio_rpc::{sim, DriveClient, DriveConnector, StatusCode};

/// Process-wide engine state, constructed once at startup.
pub struct Runtime {
    cluster_map: ClusterMap,
    cache: Arc<DataCache>,
    engine: parking_lot::Mutex<EngineConfig>,
}

impl Runtime {
    /// Build the runtime from merged configuration and a drive connector.
    pub async fn new(config: Config, connector: Arc<dyn DriveConnector>) -> Result<Arc<Self>> {
        let engine = config.engine;
        let cache = DataCache::new(
            engine.cache_target(),
            engine.cache_capacity,
            engine.background_threads,
            engine.background_queue_depth,
            engine.readahead_window,
        )?;

        let cluster_map = ClusterMap::new(connector);
        cluster_map.reset(config.clusters, config.drives).await;

        tracing::info!(
            cache_capacity = engine.cache_capacity,
            readahead_window = engine.readahead_window,
            "stripeio runtime initialized"
        );

        Ok(Arc::new(Self {
            cluster_map,
            cache,
            engine: parking_lot::Mutex::new(engine),
        }))
    }

    /// Build the runtime from the three environment configuration slots.
    pub async fn from_env(connector: Arc<dyn DriveConnector>) -> Result<Arc<Self>> {
        Self::new(Config::from_env()?, connector).await
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<DataCache> {
        &self.cache
    }

    #[must_use]
    pub fn cluster_map(&self) -> &ClusterMap {
        &self.cluster_map
    }

    #[must_use]
    pub fn config(&self) -> EngineConfig {
        *self.engine.lock()
    }

    /// Re-apply engine tunables, e.g. after a configuration reload.
    pub fn change_configuration(&self, engine: EngineConfig) -> Result<()> {
        self.cache.change_configuration(
            engine.cache_target(),
            engine.cache_capacity,
            engine.background_threads,
            engine.background_queue_depth,
            engine.readahead_window,
        )?;
        *self.engine.lock() = engine;
        Ok(())
    }
}
