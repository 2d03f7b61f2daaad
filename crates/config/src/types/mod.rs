mod data_dir;
mod host;
mod options;
mod raw;
mod settings;
mod topology;

use std::collections::BTreeMap;

pub use data_dir::{DataDir, node_name};
pub use host::HostAddr;
pub use options::LaunchOptions;
pub use raw::{
    RawHarness, RawMember, RawOptionMap, RawReplicaSet, RawSettings, RawShardedCluster,
    RawTopologyFile,
};
pub use settings::{DEFAULT_PORT_RANGE, HarnessSettings};
pub use topology::{
    MAX_MEMBERS, MAX_VOTING_MEMBERS, MemberSpec, ReplSetSettings, ShardedTopology, TopologyConfig,
};

/// A validated topology file.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyFile {
    pub harness: HarnessSettings,
    pub replica_sets: BTreeMap<String, TopologyConfig>,
    pub clusters: BTreeMap<String, ShardedTopology>,
}
