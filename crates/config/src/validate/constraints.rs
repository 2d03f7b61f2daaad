use std::collections::HashSet;

use crate::error::ConfigError;
use crate::types::{MAX_MEMBERS, MAX_VOTING_MEMBERS, ShardedTopology, TopologyConfig};

fn violation(errors: &mut Vec<ConfigError>, path: String, message: impl Into<String>) {
    errors.push(ConfigError::InvalidTopology { path, message: message.into() });
}

/// Replica set rules the collaborator would otherwise reject at initiate time.
pub fn check_topology(path: &str, t: &TopologyConfig, errors: &mut Vec<ConfigError>) {
    if t.name.trim().is_empty() {
        violation(errors, format!("{path}.name"), "replica set name must not be empty");
    }
    if t.members.is_empty() {
        violation(errors, format!("{path}.members"), "replica set needs at least one member");
        return;
    }
    if t.members.len() > MAX_MEMBERS {
        violation(
            errors,
            format!("{path}.members"),
            format!("{} members exceeds the limit of {MAX_MEMBERS}", t.members.len()),
        );
    }

    let mut seen = HashSet::new();
    for (idx, m) in t.members.iter().enumerate() {
        let mpath = format!("{path}.members[{idx}]");
        if !seen.insert(m.id) {
            violation(errors, format!("{mpath}.id"), format!("duplicate member id {}", m.id));
        }
        if !m.priority.is_finite() || m.priority < 0.0 {
            violation(
                errors,
                format!("{mpath}.priority"),
                format!("priority must be a non-negative number, got {}", m.priority),
            );
        }
        if m.votes > 1 {
            violation(
                errors,
                format!("{mpath}.votes"),
                format!("votes must be 0 or 1, got {}", m.votes),
            );
        }
        if m.arbiter {
            if m.priority != 0.0 {
                violation(errors, format!("{mpath}.priority"), "arbiters must have priority 0");
            }
            if m.hidden {
                violation(errors, format!("{mpath}.hidden"), "arbiters cannot be hidden");
            }
            if m.votes == 0 {
                violation(errors, format!("{mpath}.votes"), "arbiters must vote");
            }
        }
        if m.hidden && m.priority != 0.0 {
            violation(errors, format!("{mpath}.priority"), "hidden members must have priority 0");
        }
        if m.votes == 0 && m.priority != 0.0 {
            violation(
                errors,
                format!("{mpath}.priority"),
                "non-voting members must have priority 0",
            );
        }
    }

    let voting = t.voting_members().count();
    if voting > MAX_VOTING_MEMBERS {
        violation(
            errors,
            format!("{path}.members"),
            format!("{voting} voting members exceeds the limit of {MAX_VOTING_MEMBERS}"),
        );
    }
    if t.electable_members().next().is_none() {
        violation(errors, format!("{path}.members"), "at least one member must be electable");
    }

    if t.settings.election_timeout.is_zero() {
        violation(errors, format!("{path}.settings.election_timeout"), "must be greater than 0");
    }
    if t.settings.heartbeat_interval.is_zero() {
        violation(errors, format!("{path}.settings.heartbeat_interval"), "must be greater than 0");
    }
}

pub fn check_sharded(path: &str, c: &ShardedTopology, errors: &mut Vec<ConfigError>) {
    if c.routers == 0 {
        violation(errors, format!("{path}.routers"), "a sharded cluster needs at least one router");
    }
    if c.shards.is_empty() {
        violation(errors, format!("{path}.shard"), "a sharded cluster needs at least one shard");
    }

    let cfg_path = format!("{path}.config_servers");
    check_topology(&cfg_path, &c.config_servers, errors);
    if c.config_servers.members.iter().any(|m| m.arbiter) {
        violation(errors, format!("{cfg_path}.members"), "config servers cannot include arbiters");
    }

    let mut names = HashSet::new();
    names.insert(c.config_servers.name.as_str());
    for shard in &c.shards {
        let shard_path = format!("{path}.shard.{}", shard.name);
        check_topology(&shard_path, shard, errors);
        if !names.insert(shard.name.as_str()) {
            violation(errors, shard_path, format!("set name '{}' is used twice", shard.name));
        }
    }
}
