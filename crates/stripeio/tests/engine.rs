//! End-to-end scenarios against the simulator fleet.

use bytes::Bytes;
use std::sync::Arc;
use stripeio::sim::{sim_fleet, SimDrive};
use stripeio::{
    block_key, BlockMode, ClusterApi, Config, DataBlock, RedundancyMode, RequestMode, Runtime,
};

const LOCATION: &str = r#"{"location": [
    {"wwn": "wwn-0", "interfaces": [{"name": "eth0", "ip": "sim-0", "port": 8123}]},
    {"wwn": "wwn-1", "interfaces": [{"name": "eth0", "ip": "sim-1", "port": 8123}]},
    {"wwn": "wwn-2", "interfaces": [{"name": "eth0", "ip": "sim-2", "port": 8123}]}
]}"#;

const SECURITY: &str = r#"{"security": [
    {"wwn": "wwn-0", "identity": "test", "key": "secret"},
    {"wwn": "wwn-1", "identity": "test", "key": "secret"},
    {"wwn": "wwn-2", "identity": "test", "key": "secret"}
]}"#;

const CLUSTER: &str = r#"{
    "cluster": [
        {"id": "alpha", "numData": 2, "numParity": 1, "blockSize": 64,
         "minReconnectInterval": 1, "operationTimeout": 5,
         "drives": ["wwn-0", "wwn-1", "wwn-2"]}
    ],
    "configuration": {
        "cacheCapacity": 8192,
        "readaheadWindow": 5,
        "backgroundThreads": 2,
        "backgroundQueueDepth": 0
    }
}"#;

async fn runtime() -> (Arc<Runtime>, Vec<Arc<SimDrive>>) {
    let (connector, _endpoints, drives) = sim_fleet(3, 64);
    let config = Config::from_documents(LOCATION, SECURITY, CLUSTER).unwrap();
    let runtime = Runtime::new(config, connector).await.unwrap();
    (runtime, drives)
}

/// Full-size value survives the loss of one stripe drive.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_read_survives_drive_outage() {
    let (runtime, drives) = runtime().await;
    let cluster = runtime
        .cluster_map()
        .get_cluster("alpha", RedundancyMode::Erasure)
        .await
        .unwrap();
    assert_eq!(cluster.limits().max_value_size, 128);

    let owner = runtime.cache().register_owner(cluster, &b"volumes/a"[..]);
    let block = runtime
        .cache()
        .get(owner, 0, BlockMode::Create, RequestMode::Standard)
        .await
        .unwrap();
    block.write(0, &[b'x'; 128]).await.unwrap();
    runtime.cache().flush_owner(owner).await.unwrap();

    // Drop the owner so the next read goes back to the cluster.
    runtime.cache().drop_owner(owner);

    let key = block_key(b"volumes/a", 0);
    drives[crc32c::crc32c(&key) as usize % 3].stop();

    let cluster = runtime
        .cluster_map()
        .get_cluster("alpha", RedundancyMode::Erasure)
        .await
        .unwrap();
    let owner = runtime.cache().register_owner(cluster, &b"volumes/a"[..]);
    let block = runtime
        .cache()
        .get(owner, 0, BlockMode::Standard, RequestMode::Standard)
        .await
        .unwrap();

    let mut buf = vec![0u8; 128];
    block.read(0, &mut buf).await.unwrap();
    assert_eq!(buf, vec![b'x'; 128]);
    runtime.cache().drop_owner(owner);
}

/// Two uncoordinated writers of the same key merge through the optimistic
/// flush retry: the second flush observes the mismatch, re-fetches and
/// re-applies its updates.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_concurrent_writers_merge() {
    let (runtime, _drives) = runtime().await;
    let cluster = runtime
        .cluster_map()
        .get_cluster("alpha", RedundancyMode::Erasure)
        .await
        .unwrap();

    let key = Bytes::from_static(b"shared_0000000000");
    let a = DataBlock::new(
        Arc::clone(&cluster) as Arc<dyn ClusterApi>,
        key.clone(),
        BlockMode::Create,
    );
    let b = DataBlock::new(
        Arc::clone(&cluster) as Arc<dyn ClusterApi>,
        key.clone(),
        BlockMode::Create,
    );

    a.write(0, &[b'A'; 32]).await.unwrap();
    b.write(32, &[b'B'; 32]).await.unwrap();

    a.flush().await.unwrap();
    b.flush().await.unwrap();

    let (value, _) = cluster.get(&key).await.unwrap();
    assert_eq!(&value[..32], &[b'A'; 32]);
    assert_eq!(&value[32..64], &[b'B'; 32]);
}

/// Sequential access materializes readahead blocks beyond those the
/// client requested.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_sequential_reads_prefetch() {
    let (runtime, _drives) = runtime().await;
    let cluster = runtime
        .cluster_map()
        .get_cluster("alpha", RedundancyMode::Erasure)
        .await
        .unwrap();
    let owner = runtime.cache().register_owner(cluster, &b"volumes/seq"[..]);

    for n in 0..3u64 {
        runtime
            .cache()
            .get(owner, n, BlockMode::Standard, RequestMode::Standard)
            .await
            .unwrap();
    }

    // Three requested plus at least the first predicted blocks.
    assert!(runtime.cache().stats().items > 3);
    runtime.cache().drop_owner(owner);
    assert_eq!(runtime.cache().stats().items, 0);
}

/// Runtime construction through the environment slots.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_boots_from_environment() {
    let (connector, _endpoints, _drives) = sim_fleet(3, 64);
    std::env::set_var("DRIVE_LOCATION", LOCATION);
    std::env::set_var("DRIVE_SECURITY", SECURITY);
    std::env::set_var("CLUSTER_DEFINITION", CLUSTER);

    let runtime = Runtime::from_env(connector).await.unwrap();
    assert_eq!(runtime.config().cache_capacity, 8192);

    let cluster = runtime
        .cluster_map()
        .get_cluster("alpha", RedundancyMode::Replication)
        .await
        .unwrap();
    let key = Bytes::from_static(b"env-key");
    cluster.put(&key, None, b"payload", false).await.unwrap();
    let (value, _) = cluster.get(&key).await.unwrap();
    assert_eq!(&value[..], b"payload");

    std::env::remove_var("DRIVE_LOCATION");
    std::env::remove_var("DRIVE_SECURITY");
    std::env::remove_var("CLUSTER_DEFINITION");
}
