//! Cluster instance map.
//!
//! Produces cluster handles by id from installed configuration. Handles
//! are built on first request and shared thereafter; admin instances are
//! always fresh.

use std::collections::HashMap;
use std::sync::Arc;

use stripeio_common::{config::DriveInfo, ClusterInstanceInfo, Error, RedundancyMode, Result};
use stripeio_rpc::DriveConnector;

use crate::admin::AdminCluster;
use crate::cluster::StripeCluster;

struct MapState {
    clusters: HashMap<String, ClusterInstanceInfo>,
    drives: HashMap<String, DriveInfo>,
    instances: HashMap<(String, RedundancyMode), Arc<StripeCluster>>,
}

pub struct ClusterMap {
    connector: Arc<dyn DriveConnector>,
    state: tokio::sync::Mutex<MapState>,
}

impl ClusterMap {
    pub fn new(connector: Arc<dyn DriveConnector>) -> Self {
        Self {
            connector,
            state: tokio::sync::Mutex::new(MapState {
                clusters: HashMap::new(),
                drives: HashMap::new(),
                instances: HashMap::new(),
            }),
        }
    }

    /// Install configuration, dropping previously built instances.
    pub async fn reset(
        &self,
        clusters: HashMap<String, ClusterInstanceInfo>,
        drives: HashMap<String, DriveInfo>,
    ) {
        let mut state = self.state.lock().await;
        state.clusters = clusters;
        state.drives = drives;
        state.instances.clear();
    }

    /// Shared cluster handle for an id, built on first use.
    pub async fn get_cluster(
        &self,
        id: &str,
        redundancy: RedundancyMode,
    ) -> Result<Arc<StripeCluster>> {
        let mut state = self.state.lock().await;
        let cache_key = (id.to_string(), redundancy);
        if let Some(instance) = state.instances.get(&cache_key) {
            return Ok(Arc::clone(instance));
        }
        let instance = Self::build(&self.connector, &state, id, redundancy).await?;
        state.instances.insert(cache_key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Fresh admin instance for an id.
    pub async fn get_admin_cluster(
        &self,
        id: &str,
        redundancy: RedundancyMode,
    ) -> Result<AdminCluster> {
        let state = self.state.lock().await;
        let instance = Self::build(&self.connector, &state, id, redundancy).await?;
        Ok(AdminCluster::new(instance))
    }

    async fn build(
        connector: &Arc<dyn DriveConnector>,
        state: &MapState,
        id: &str,
        redundancy: RedundancyMode,
    ) -> Result<Arc<StripeCluster>> {
        let info = state
            .clusters
            .get(id)
            .ok_or_else(|| Error::internal(format!("no cluster configured under id {id}")))?;

        let mut endpoints = Vec::with_capacity(info.drives.len());
        for wwn in &info.drives {
            let drive = state.drives.get(wwn).ok_or_else(|| {
                Error::internal(format!("cluster {id} references unknown drive {wwn}"))
            })?;
            endpoints.push((drive.primary.clone(), drive.secondary.clone()));
        }

        StripeCluster::open(
            id,
            info.num_data,
            info.num_parity,
            endpoints,
            redundancy,
            info.reconnect_interval,
            info.operation_timeout,
            Arc::clone(connector),
        )
        .await
    }
}
