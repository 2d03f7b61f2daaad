use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::options::LaunchOptions;
use crate::error::{ConfigError, Result};
use crate::validate::constraints;

/// Hard limits enforced by the collaborator's replica set config validation.
pub const MAX_MEMBERS: usize = 50;
pub const MAX_VOTING_MEMBERS: usize = 7;

/// One replica set member as declared by the test author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub id: u32,
    pub priority: f64,
    pub votes: u32,
    pub arbiter: bool,
    pub hidden: bool,
    /// Per-member launch options, applied over the set-wide ones.
    #[serde(default)]
    pub options: LaunchOptions,
}

impl MemberSpec {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            priority: 1.0,
            votes: 1,
            arbiter: false,
            hidden: false,
            options: LaunchOptions::new(),
        }
    }

    pub fn arbiter(id: u32) -> Self {
        Self { priority: 0.0, arbiter: true, ..Self::new(id) }
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn votes(mut self, votes: u32) -> Self {
        self.votes = votes;
        self
    }

    /// Hidden members never become primary, so this also zeroes the priority.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self.priority = 0.0;
        self
    }

    pub fn option(mut self, name: &str, value: impl Into<String>) -> Self {
        self.options.insert(name, value);
        self
    }

    pub fn is_voting(&self) -> bool {
        self.votes > 0
    }

    pub fn is_electable(&self) -> bool {
        !self.arbiter && !self.hidden && self.votes > 0 && self.priority > 0.0
    }
}

/// Timing knobs forwarded into the replica set config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplSetSettings {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub chaining_allowed: bool,
}

impl Default for ReplSetSettings {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
            chaining_allowed: true,
        }
    }
}

/// Declarative description of a replica set. Never mutated once handed to a
/// controller; reconfigs produce a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub name: String,
    pub members: Vec<MemberSpec>,
    #[serde(default)]
    pub settings: ReplSetSettings,
    /// Launch options shared by every member.
    #[serde(default)]
    pub options: LaunchOptions,
    /// Put a bridge process in front of every member so the network between
    /// members can be partitioned or delayed.
    #[serde(default)]
    pub use_bridge: bool,
}

impl TopologyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            settings: ReplSetSettings::default(),
            options: LaunchOptions::new(),
            use_bridge: false,
        }
    }

    /// `nodes` identical electable members with ids `0..nodes`.
    pub fn with_nodes(name: impl Into<String>, nodes: u32) -> Self {
        let mut topology = Self::new(name);
        topology.members = (0..nodes).map(MemberSpec::new).collect();
        topology
    }

    pub fn member(mut self, member: MemberSpec) -> Self {
        self.members.push(member);
        self
    }

    pub fn option(mut self, name: &str, value: impl Into<String>) -> Self {
        self.options.insert(name, value);
        self
    }

    pub fn flag(self, name: &str) -> Self {
        self.option(name, "")
    }

    pub fn with_settings(mut self, settings: ReplSetSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn bridged(mut self) -> Self {
        self.use_bridge = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        constraints::check_topology(&self.name, self, &mut errors);
        ConfigError::collect(errors)
    }

    pub fn member_by_id(&self, id: u32) -> Option<&MemberSpec> {
        self.members.iter().find(|m| m.id == id)
    }

    /// The smallest id greater than every existing one. Saturates at
    /// `u32::MAX`, which validation then reports as a duplicate id.
    pub fn next_member_id(&self) -> u32 {
        self.members.iter().map(|m| m.id.saturating_add(1)).max().unwrap_or(0)
    }

    pub fn voting_members(&self) -> impl Iterator<Item = &MemberSpec> {
        self.members.iter().filter(|m| m.is_voting())
    }

    pub fn electable_members(&self) -> impl Iterator<Item = &MemberSpec> {
        self.members.iter().filter(|m| m.is_electable())
    }

    /// Votes needed to elect a primary or commit a write.
    pub fn majority(&self) -> usize {
        self.voting_members().count() / 2 + 1
    }

    /// Ids of the electable members sharing the highest priority.
    pub fn highest_priority_members(&self) -> Vec<u32> {
        let top = self.electable_members().map(|m| m.priority).fold(f64::MIN, f64::max);
        self.electable_members().filter(|m| m.priority == top).map(|m| m.id).collect()
    }

    /// Set-wide options with the member's own options applied on top.
    pub fn launch_options(&self, member: &MemberSpec) -> LaunchOptions {
        self.options.merged(&member.options)
    }

    pub fn with_member(&self, member: MemberSpec) -> Self {
        self.clone().member(member)
    }

    pub fn without_member(&self, id: u32) -> Self {
        let mut next = self.clone();
        next.members.retain(|m| m.id != id);
        next
    }
}

/// Config servers, shards and routers of one sharded cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedTopology {
    pub name: String,
    pub config_servers: TopologyConfig,
    pub shards: Vec<TopologyConfig>,
    pub routers: u32,
    #[serde(default)]
    pub router_options: LaunchOptions,
}

impl ShardedTopology {
    /// A cluster of `shards` replica sets with `nodes_per_shard` members each,
    /// a single-member config server set and one router.
    pub fn new(name: impl Into<String>, shards: u32, nodes_per_shard: u32) -> Self {
        let name = name.into();
        Self {
            config_servers: TopologyConfig::with_nodes(format!("{name}-configRS"), 1),
            shards: (0..shards)
                .map(|i| TopologyConfig::with_nodes(format!("{name}-rs{i}"), nodes_per_shard))
                .collect(),
            routers: 1,
            router_options: LaunchOptions::new(),
            name,
        }
    }

    pub fn routers(mut self, routers: u32) -> Self {
        self.routers = routers;
        self
    }

    pub fn config_servers(mut self, config_servers: TopologyConfig) -> Self {
        self.config_servers = config_servers;
        self
    }

    pub fn shard(mut self, shard: TopologyConfig) -> Self {
        self.shards.push(shard);
        self
    }

    /// Apply `settings` to the config server set and every shard.
    pub fn with_settings(mut self, settings: ReplSetSettings) -> Self {
        self.config_servers.settings = settings.clone();
        for shard in &mut self.shards {
            shard.settings = settings.clone();
        }
        self
    }

    pub fn shard_names(&self) -> Vec<&str> {
        self.shards.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        constraints::check_sharded(&self.name, self, &mut errors);
        ConfigError::collect(errors)
    }
}
