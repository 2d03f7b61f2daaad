pub(crate) mod constraints;
mod parse;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};
use crate::types::*;

/// Resolve a raw HCL topology file into validated topologies.
pub fn resolve(raw: RawTopologyFile) -> Result<TopologyFile> {
    let mut errors = Vec::new();

    let harness = resolve_harness(raw.harness.as_ref(), &mut errors);

    let mut replica_sets = BTreeMap::new();
    for (name, raw_set) in &raw.replica_set {
        let path = format!("replica_set.{name}");
        let topology = resolve_replica_set(&path, name, raw_set, &mut errors);
        constraints::check_topology(&path, &topology, &mut errors);
        replica_sets.insert(name.clone(), topology);
    }

    let mut clusters = BTreeMap::new();
    for (name, raw_cluster) in &raw.sharded_cluster {
        let path = format!("sharded_cluster.{name}");
        let cluster = resolve_cluster(&path, name, raw_cluster, &mut errors);
        constraints::check_sharded(&path, &cluster, &mut errors);
        clusters.insert(name.clone(), cluster);
    }

    check_unique_set_names(&replica_sets, &clusters, &mut errors);

    ConfigError::collect(errors)?;
    Ok(TopologyFile { harness, replica_sets, clusters })
}

fn resolve_harness(raw: Option<&RawHarness>, errors: &mut Vec<ConfigError>) -> HarnessSettings {
    let mut settings = HarnessSettings::default();
    let Some(raw) = raw else {
        return settings;
    };
    if let Some(dir) = &raw.data_dir {
        settings.data_dir = DataDir::new(dir);
    }
    if let Some(host) = &raw.host {
        settings.host = host.clone();
    }
    if let Some(bin) = &raw.server_bin {
        settings.server_bin = PathBuf::from(bin);
    }
    if let Some(bin) = &raw.router_bin {
        settings.router_bin = PathBuf::from(bin);
    }
    if let Some(bin) = &raw.bridge_bin {
        settings.bridge_bin = PathBuf::from(bin);
    }
    if let Some(range) = &raw.port_range
        && let Some(range) = parse::parse_port_range("harness.port_range", range, errors)
    {
        settings.port_range = range;
    }
    settings
}

fn resolve_replica_set(
    path: &str,
    name: &str,
    raw: &RawReplicaSet,
    errors: &mut Vec<ConfigError>,
) -> TopologyConfig {
    let mut topology = match (raw.nodes, raw.members.is_empty()) {
        (Some(_), false) => {
            errors.push(ConfigError::InvalidField {
                path: format!("{path}.nodes"),
                message: "set either nodes or members, not both".to_owned(),
            });
            TopologyConfig::new(name)
        }
        (Some(n), true) => TopologyConfig::with_nodes(name, n),
        (None, _) => {
            let mut t = TopologyConfig::new(name);
            for (idx, m) in raw.members.iter().enumerate() {
                let mpath = format!("{path}.members[{idx}]");
                t.members.push(resolve_member(&mpath, idx as u32, m, errors));
            }
            t
        }
    };

    topology.use_bridge = raw.bridge;
    topology.options.flags = parse::parse_options(&format!("{path}.options"), &raw.options, errors);
    topology.options.set_parameters =
        parse::parse_options(&format!("{path}.set_parameters"), &raw.set_parameters, errors);

    if let Some(s) = &raw.settings {
        let spath = format!("{path}.settings");
        if let Some(d) = &s.election_timeout {
            topology.settings.election_timeout =
                parse::parse_duration(&format!("{spath}.election_timeout"), d, errors);
        }
        if let Some(d) = &s.heartbeat_interval {
            topology.settings.heartbeat_interval =
                parse::parse_duration(&format!("{spath}.heartbeat_interval"), d, errors);
        }
        if let Some(chaining) = s.chaining_allowed {
            topology.settings.chaining_allowed = chaining;
        }
    }
    topology
}

fn resolve_member(
    path: &str,
    idx: u32,
    raw: &RawMember,
    errors: &mut Vec<ConfigError>,
) -> MemberSpec {
    let id = raw.id.unwrap_or(idx);
    let mut member = if raw.arbiter { MemberSpec::arbiter(id) } else { MemberSpec::new(id) };
    if let Some(p) = raw.priority {
        member.priority = p;
    }
    if let Some(v) = raw.votes {
        member.votes = v;
    }
    if raw.hidden {
        member.hidden = true;
        if raw.priority.is_none() {
            member.priority = 0.0;
        }
    }
    member.options.flags = parse::parse_options(&format!("{path}.options"), &raw.options, errors);
    member
}

fn resolve_cluster(
    path: &str,
    name: &str,
    raw: &RawShardedCluster,
    errors: &mut Vec<ConfigError>,
) -> ShardedTopology {
    let cfg_name = format!("{name}-configRS");
    let config_servers = match &raw.config_servers {
        Some(cfg) => resolve_replica_set(&format!("{path}.config_servers"), &cfg_name, cfg, errors),
        None => TopologyConfig::with_nodes(cfg_name, 1),
    };

    let shards = raw
        .shard
        .iter()
        .map(|(shard_name, s)| {
            resolve_replica_set(&format!("{path}.shard.{shard_name}"), shard_name, s, errors)
        })
        .collect();

    let mut router_options = LaunchOptions::new();
    router_options.flags =
        parse::parse_options(&format!("{path}.router_options"), &raw.router_options, errors);

    ShardedTopology {
        name: name.to_owned(),
        config_servers,
        shards,
        routers: raw.routers,
        router_options,
    }
}

/// Set names double as data directory prefixes, so they must not collide
/// across the whole file. Duplicates inside one cluster are reported by
/// `check_sharded`.
fn check_unique_set_names(
    replica_sets: &BTreeMap<String, TopologyConfig>,
    clusters: &BTreeMap<String, ShardedTopology>,
    errors: &mut Vec<ConfigError>,
) {
    let mut owners: HashMap<&str, String> =
        replica_sets.keys().map(|n| (n.as_str(), format!("replica_set.{n}"))).collect();
    for (cluster_name, cluster) in clusters {
        let path = format!("sharded_cluster.{cluster_name}");
        let mut names = HashSet::new();
        for set in std::iter::once(&cluster.config_servers).chain(cluster.shards.iter()) {
            if !names.insert(set.name.as_str()) {
                continue;
            }
            if let Some(owner) = owners.get(set.name.as_str()) {
                errors.push(ConfigError::InvalidTopology {
                    path: path.clone(),
                    message: format!("set name '{}' is already used by {owner}", set.name),
                });
            }
        }
        for name in names {
            owners.insert(name, path.clone());
        }
    }
}
