use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Option values as written in HCL: strings, numbers, or `true` for a bare flag.
pub type RawOptionMap = BTreeMap<String, hcl::Value>;

/// Raw HCL-deserialized topology file. Durations and ranges are still strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawTopologyFile {
    #[serde(default)]
    pub harness: Option<RawHarness>,
    #[serde(default)]
    pub replica_set: BTreeMap<String, RawReplicaSet>,
    #[serde(default)]
    pub sharded_cluster: BTreeMap<String, RawShardedCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawHarness {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub server_bin: Option<String>,
    #[serde(default)]
    pub router_bin: Option<String>,
    #[serde(default)]
    pub bridge_bin: Option<String>,
    /// `"start-end"`, inclusive.
    #[serde(default)]
    pub port_range: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawReplicaSet {
    /// Shorthand for that many default members. Mutually exclusive with `members`.
    #[serde(default)]
    pub nodes: Option<u32>,
    #[serde(default)]
    pub members: Vec<RawMember>,
    #[serde(default)]
    pub bridge: bool,
    #[serde(default)]
    pub options: RawOptionMap,
    #[serde(default)]
    pub set_parameters: RawOptionMap,
    #[serde(default)]
    pub settings: Option<RawSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawMember {
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub priority: Option<f64>,
    #[serde(default)]
    pub votes: Option<u32>,
    #[serde(default)]
    pub arbiter: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub options: RawOptionMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawSettings {
    #[serde(default)]
    pub election_timeout: Option<String>,
    #[serde(default)]
    pub heartbeat_interval: Option<String>,
    #[serde(default)]
    pub chaining_allowed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawShardedCluster {
    #[serde(default = "default_routers")]
    pub routers: u32,
    #[serde(default)]
    pub router_options: RawOptionMap,
    #[serde(default)]
    pub config_servers: Option<RawReplicaSet>,
    #[serde(default)]
    pub shard: BTreeMap<String, RawReplicaSet>,
}

fn default_routers() -> u32 {
    1
}
