use std::sync::Arc;
use std::time::Duration;

use fleet_config::{HarnessSettings, ReplSetSettings, ShardedTopology, TopologyConfig};
use fleet_harness::{Harness, ReplicaSetHandle, ShardedClusterHandle};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::sim::{SimFleet, SimSettings};

/// Election timing short enough for tests to fail over in well under a second.
pub fn fast_settings() -> ReplSetSettings {
    ReplSetSettings {
        election_timeout: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(50),
        chaining_allowed: true,
    }
}

/// Route `tracing` output through the test writer, filtered by `RUST_LOG`.
/// Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A [`Harness`] wired to a simulated fleet, with data under a temp dir that
/// is removed on drop.
pub struct TestFleet {
    pub harness: Harness,
    pub sim: Arc<SimFleet>,
    dir: TempDir,
}

impl TestFleet {
    pub fn new() -> Self {
        Self::with_sim(SimSettings::default())
    }

    pub fn with_sim(sim_settings: SimSettings) -> Self {
        fleet_config::env::init_test_defaults();
        init_test_logging();

        let dir = tempfile::tempdir().unwrap();
        let settings = HarnessSettings::new(dir.path()).port_range(30000, 39999);
        let sim = SimFleet::new(sim_settings);
        let harness = Harness::new(settings, sim.clone(), sim.clone());
        Self { harness, sim, dir }
    }

    pub fn data_dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// `nodes` electable members with fast election settings.
    pub fn topology(name: &str, nodes: u32) -> TopologyConfig {
        TopologyConfig::with_nodes(name, nodes).with_settings(fast_settings())
    }

    pub fn sharded_topology(name: &str, shards: u32, nodes: u32) -> ShardedTopology {
        ShardedTopology::new(name, shards, nodes).with_settings(fast_settings())
    }

    /// Start and initiate a replica set of `nodes` members.
    pub async fn replica_set(&mut self, name: &str, nodes: u32) -> ReplicaSetHandle {
        self.harness.start_replica_set(&Self::topology(name, nodes)).await.unwrap()
    }

    /// Same as [`replica_set`](Self::replica_set) with a bridge per member.
    pub async fn bridged_set(&mut self, name: &str, nodes: u32) -> ReplicaSetHandle {
        let topology = Self::topology(name, nodes).bridged();
        self.harness.start_replica_set(&topology).await.unwrap()
    }

    pub async fn cluster(&mut self, name: &str, shards: u32, nodes: u32) -> ShardedClusterHandle {
        let topology = Self::sharded_topology(name, shards, nodes);
        self.harness.start_cluster(&topology).await.unwrap()
    }
}
