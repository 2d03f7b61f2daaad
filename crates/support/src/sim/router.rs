//! Routers and the sharding catalog they front.

use std::collections::BTreeMap;

use fleet_config::HostAddr;
use fleet_harness::admin::protocol::{
    AdminCommand, BalancerStatus, ChunkInfo, KeyBound, MemberState, ShardInfo, codes, error_reply,
    ok_reply,
};
use serde_json::{Value, json};
use tokio::time::Instant;

use super::world::{NodeKind, World};

struct Migration {
    ns: String,
    min: KeyBound,
    to: String,
    done_at: Instant,
}

/// Cluster metadata held by the config server set.
#[derive(Default)]
pub(crate) struct Catalog {
    shards: Vec<ShardInfo>,
    /// Namespace to shard key.
    collections: BTreeMap<String, String>,
    chunks: BTreeMap<String, Vec<ChunkInfo>>,
    migrations: Vec<Migration>,
    balancer_on: bool,
    round_ends_at: Option<Instant>,
    next_round_at: Option<Instant>,
    rounds: u64,
}

impl Catalog {
    fn status(&self) -> BalancerStatus {
        BalancerStatus {
            mode: if self.balancer_on { "full" } else { "off" }.to_owned(),
            in_balancer_round: self.round_ends_at.is_some(),
            num_balancer_rounds: self.rounds,
        }
    }

    fn migrating(&self, ns: &str) -> bool {
        self.migrations.iter().any(|m| m.ns == ns)
    }

    /// Chunk counts per shard for `ns`, including empty shards.
    fn distribution(&self, ns: &str) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> =
            self.shards.iter().map(|s| (s.id.clone(), 0)).collect();
        for chunk in self.chunks.get(ns).into_iter().flatten() {
            *counts.entry(chunk.shard.clone()).or_default() += 1;
        }
        counts
    }
}

pub(crate) fn handle(
    world: &mut World,
    addr: &HostAddr,
    cmd: &AdminCommand,
    now: Instant,
) -> Value {
    let Some(config_set) = world.nodes.get(addr).and_then(|n| match &n.kind {
        NodeKind::Router(r) => Some(r.config_set.clone()),
        _ => None,
    }) else {
        return error_reply(codes::INTERNAL_ERROR, "InternalError", "not a router");
    };

    match cmd {
        AdminCommand::Ping => return ok_reply(json!({})),
        AdminCommand::Hello => {
            return ok_reply(json!({ "isWritablePrimary": true, "msg": "isdbgrid" }));
        }
        _ => {}
    }

    let writes = matches!(
        cmd,
        AdminCommand::AddShard { .. }
            | AdminCommand::ShardCollection { .. }
            | AdminCommand::Split { .. }
            | AdminCommand::MoveChunk { .. }
            | AdminCommand::BalancerStart
            | AdminCommand::BalancerStop
    );
    if writes && !has_primary(world, &config_set, now) {
        return error_reply(
            codes::FAILED_TO_SATISFY_READ_PREFERENCE,
            "FailedToSatisfyReadPreference",
            format!("could not find a primary for {config_set}"),
        );
    }

    match cmd {
        AdminCommand::AddShard { name, connection } => {
            add_shard(world, &config_set, name, connection, now)
        }
        AdminCommand::MoveChunk { ns, find, to } => {
            let migration_delay = world.settings.migration_delay;
            let donor = world
                .catalogs
                .get(&config_set)
                .and_then(|c| c.chunks.get(ns))
                .and_then(|chunks| chunks.iter().find(|c| c.contains(*find)))
                .map(|c| c.shard.clone());
            for shard in donor.iter().chain(std::iter::once(to)) {
                if !has_primary(world, shard, now) {
                    return error_reply(
                        codes::FAILED_TO_SATISFY_READ_PREFERENCE,
                        "FailedToSatisfyReadPreference",
                        format!("shard {shard} has no primary"),
                    );
                }
            }
            let catalog = world.catalogs.entry(config_set).or_default();
            move_chunk(catalog, ns, *find, to, now + migration_delay)
        }
        other => {
            let catalog = world.catalogs.entry(config_set).or_default();
            catalog_command(catalog, other, now)
        }
    }
}

fn catalog_command(catalog: &mut Catalog, cmd: &AdminCommand, now: Instant) -> Value {
    match cmd {
        AdminCommand::ListShards => ok_reply(json!({ "shards": catalog.shards })),
        AdminCommand::ShardCollection { ns, key } => {
            if let Some(existing) = catalog.collections.get(ns) {
                if existing == key {
                    return ok_reply(json!({ "collectionsharded": ns }));
                }
                return error_reply(
                    codes::ILLEGAL_OPERATION,
                    "IllegalOperation",
                    format!("{ns} is already sharded on {existing}"),
                );
            }
            let Some(first) = catalog.shards.first() else {
                return error_reply(codes::SHARD_NOT_FOUND, "ShardNotFound", "no shards registered");
            };
            let chunk = ChunkInfo {
                ns: ns.clone(),
                min: KeyBound::MinKey,
                max: KeyBound::MaxKey,
                shard: first.id.clone(),
            };
            catalog.chunks.insert(ns.clone(), vec![chunk]);
            catalog.collections.insert(ns.clone(), key.clone());
            ok_reply(json!({ "collectionsharded": ns }))
        }
        AdminCommand::Split { ns, middle } => split(catalog, ns, *middle),
        AdminCommand::ListChunks { ns } => {
            let chunks = catalog.chunks.get(ns).cloned().unwrap_or_default();
            ok_reply(json!({ "chunks": chunks }))
        }
        AdminCommand::BalancerStart => {
            if !catalog.balancer_on {
                catalog.balancer_on = true;
                catalog.next_round_at = Some(now);
            }
            ok_reply(json!({}))
        }
        AdminCommand::BalancerStop => {
            catalog.balancer_on = false;
            catalog.next_round_at = None;
            catalog.round_ends_at = None;
            ok_reply(json!({}))
        }
        AdminCommand::BalancerStatus => ok_reply(catalog.status()),
        other => error_reply(
            codes::COMMAND_NOT_FOUND,
            "CommandNotFound",
            format!("no such command on a router: {}", other.name()),
        ),
    }
}

fn has_primary(world: &World, set: &str, now: Instant) -> bool {
    world.nodes.values().any(|n| {
        n.is_ready(now)
            && n.server().is_some_and(|s| {
                s.set_name.as_deref() == Some(set) && s.state == MemberState::Primary
            })
    })
}

fn add_shard(
    world: &mut World,
    config_set: &str,
    name: &str,
    connection: &str,
    now: Instant,
) -> Value {
    if world.refused_shards.contains(name) {
        return error_reply(
            codes::OPERATION_FAILED,
            "OperationFailed",
            format!("shard {name} refused by the config servers"),
        );
    }
    let Some((set, hosts)) = connection.split_once('/') else {
        return error_reply(
            codes::OPERATION_FAILED,
            "OperationFailed",
            format!("bad connection string {connection}"),
        );
    };
    let reachable = hosts.split(',').filter_map(|h| h.parse::<HostAddr>().ok()).any(|h| {
        world.live_server(&world.resolve(&h), now).is_some_and(|s| {
            s.set_name.as_deref() == Some(set)
        })
    });
    if !reachable {
        return error_reply(
            codes::OPERATION_FAILED,
            "OperationFailed",
            format!("no member of {connection} is reachable"),
        );
    }
    let catalog = world.catalogs.entry(config_set.to_owned()).or_default();
    match catalog.shards.iter().find(|s| s.id == name) {
        Some(existing) if existing.host == connection => {}
        Some(existing) => {
            return error_reply(
                codes::OPERATION_FAILED,
                "OperationFailed",
                format!("shard {name} already exists as {}", existing.host),
            );
        }
        None => catalog.shards.push(ShardInfo { id: name.to_owned(), host: connection.to_owned() }),
    }
    ok_reply(json!({ "shardAdded": name }))
}

fn split(catalog: &mut Catalog, ns: &str, middle: i64) -> Value {
    if catalog.migrating(ns) {
        return conflicting(ns);
    }
    let Some(chunks) = catalog.chunks.get_mut(ns) else {
        return not_sharded(ns);
    };
    let Some(i) = chunks.iter().position(|c| c.contains(middle)) else {
        return not_sharded(ns);
    };
    if chunks[i].min == KeyBound::Value(middle) {
        return ok_reply(json!({}));
    }
    let upper = ChunkInfo { min: KeyBound::Value(middle), ..chunks[i].clone() };
    chunks[i].max = KeyBound::Value(middle);
    chunks.insert(i + 1, upper);
    ok_reply(json!({}))
}

fn move_chunk(catalog: &mut Catalog, ns: &str, find: i64, to: &str, done_at: Instant) -> Value {
    if !catalog.shards.iter().any(|s| s.id == to) {
        return error_reply(codes::SHARD_NOT_FOUND, "ShardNotFound", format!("no shard {to}"));
    }
    if catalog.migrating(ns) {
        return conflicting(ns);
    }
    let Some(chunk) = catalog.chunks.get(ns).and_then(|c| c.iter().find(|c| c.contains(find)))
    else {
        return not_sharded(ns);
    };
    if chunk.shard != to {
        let min = chunk.min;
        catalog.migrations.push(Migration { ns: ns.to_owned(), min, to: to.to_owned(), done_at });
    }
    ok_reply(json!({ "millis": 0 }))
}

fn not_sharded(ns: &str) -> Value {
    error_reply(codes::NAMESPACE_NOT_FOUND, "NamespaceNotFound", format!("{ns} is not sharded"))
}

fn conflicting(ns: &str) -> Value {
    error_reply(
        codes::CONFLICTING_OPERATION_IN_PROGRESS,
        "ConflictingOperationInProgress",
        format!("a migration of {ns} is in progress"),
    )
}

/// Finish due migrations and run balancer rounds.
pub(crate) fn tick(world: &mut World, now: Instant) {
    let interval = world.settings.balancer_interval;
    let migration_delay = world.settings.migration_delay;
    for catalog in world.catalogs.values_mut() {
        let (done, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut catalog.migrations).into_iter().partition(|m| m.done_at <= now);
        catalog.migrations = pending;
        for m in done {
            if let Some(chunk) = catalog
                .chunks
                .get_mut(&m.ns)
                .and_then(|chunks| chunks.iter_mut().find(|c| c.min == m.min))
            {
                chunk.shard = m.to;
            }
        }

        if !catalog.balancer_on {
            continue;
        }
        if let Some(ends) = catalog.round_ends_at {
            if ends <= now {
                balance(catalog, now + migration_delay);
                catalog.round_ends_at = None;
                catalog.rounds += 1;
                catalog.next_round_at = Some(now + interval);
            }
        } else if catalog.next_round_at.is_some_and(|at| at <= now) {
            catalog.round_ends_at = Some(now + interval / 4);
        }
    }
}

/// Move one chunk per collection from the most to the least loaded shard.
fn balance(catalog: &mut Catalog, done_at: Instant) {
    let namespaces: Vec<String> = catalog.collections.keys().cloned().collect();
    for ns in namespaces {
        if catalog.migrating(&ns) {
            continue;
        }
        let counts = catalog.distribution(&ns);
        let Some((from, most)) = counts.iter().max_by_key(|(_, n)| **n) else { continue };
        let Some((to, least)) = counts.iter().min_by_key(|(_, n)| **n) else { continue };
        if most - least < 2 {
            continue;
        }
        let Some(chunk) =
            catalog.chunks.get(&ns).and_then(|c| c.iter().find(|c| &c.shard == from))
        else {
            continue;
        };
        let migration = Migration { ns: ns.clone(), min: chunk.min, to: to.clone(), done_at };
        catalog.migrations.push(migration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(shards: &[&str]) -> Catalog {
        let mut c = Catalog::default();
        for s in shards {
            c.shards.push(ShardInfo { id: (*s).to_owned(), host: format!("{s}/127.0.0.1:1") });
        }
        c
    }

    #[test]
    fn split_then_move_then_finish() {
        let now = Instant::now();
        let mut c = catalog(&["s0", "s1"]);
        let shard = AdminCommand::ShardCollection { ns: "db.c".into(), key: "x".into() };
        assert_eq!(catalog_command(&mut c, &shard, now)["ok"], 1);
        assert_eq!(split(&mut c, "db.c", 10)["ok"], 1);
        assert_eq!(c.chunks["db.c"].len(), 2);
        assert_eq!(c.chunks["db.c"][1].min, KeyBound::Value(10));

        assert_eq!(move_chunk(&mut c, "db.c", 15, "s1", now)["ok"], 1);
        let busy = move_chunk(&mut c, "db.c", 15, "s1", now);
        assert_eq!(busy["codeName"], "ConflictingOperationInProgress");
        assert_eq!(c.distribution("db.c")["s1"], 0);

        let mut world = World::new(Default::default());
        world.catalogs.insert("cfg".into(), c);
        tick(&mut world, now);
        assert_eq!(world.catalogs["cfg"].distribution("db.c")["s1"], 1);
    }

    #[test]
    fn split_at_existing_boundary_is_a_no_op() {
        let now = Instant::now();
        let mut c = catalog(&["s0"]);
        let shard = AdminCommand::ShardCollection { ns: "db.c".into(), key: "x".into() };
        catalog_command(&mut c, &shard, now);
        split(&mut c, "db.c", 5);
        split(&mut c, "db.c", 5);
        assert_eq!(c.chunks["db.c"].len(), 2);
        assert_eq!(split(&mut c, "db.other", 5)["codeName"], "NamespaceNotFound");
    }

    #[test]
    fn balancer_evens_out_chunks() {
        let now = Instant::now();
        let mut c = catalog(&["s0", "s1"]);
        let shard = AdminCommand::ShardCollection { ns: "db.c".into(), key: "x".into() };
        catalog_command(&mut c, &shard, now);
        for at in [10, 20, 30] {
            split(&mut c, "db.c", at);
        }
        balance(&mut c, now);
        assert_eq!(c.migrations.len(), 1);
        assert_eq!(c.migrations[0].to, "s1");
    }
}
