//! Replica set behavior of simulated servers: commands plus the periodic
//! heartbeat, election and replication pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_config::HostAddr;
use fleet_harness::admin::protocol::{
    AdminCommand, HelloReply, MemberConfig, MemberState, MemberStatus, OpTime, ReplSetConfig,
    ReplStatus, codes, error_reply, ok_reply,
};
use serde_json::{Value, json};
use tokio::time::Instant;

use super::world::{Server, World};

/// Reply a server gives, or `None` when it drops the connection.
pub(crate) fn handle(
    world: &mut World,
    addr: &HostAddr,
    cmd: &AdminCommand,
    now: Instant,
) -> Option<Value> {
    let server = world.live_server(addr, now)?;
    let reply = match cmd {
        AdminCommand::Ping => ok_reply(json!({})),
        AdminCommand::Hello => ok_reply(hello(world, addr, server)),
        AdminCommand::ReplSetInitiate { config } => initiate(world, addr, config.clone()),
        AdminCommand::ReplSetGetStatus => match server.config() {
            Some(_) => ok_reply(status(world, addr, now)),
            None => not_initialized(),
        },
        AdminCommand::ReplSetGetConfig => match server.config() {
            Some(config) => ok_reply(json!({ "config": config })),
            None => not_initialized(),
        },
        AdminCommand::ReplSetReconfig { config, force } => {
            reconfig(world, addr, config.clone(), *force, now)
        }
        AdminCommand::ReplSetStepDown { secs, force } => {
            return step_down(world, addr, Duration::from_secs(*secs), *force, now);
        }
        AdminCommand::ReplSetStepUp => step_up(world, addr, now),
        AdminCommand::ReplSetFreeze { secs } => freeze(world, addr, *secs, now),
        AdminCommand::AppendOplogNote { .. } => append_note(world, addr, now),
        other => error_reply(
            codes::COMMAND_NOT_FOUND,
            "CommandNotFound",
            format!("no such command on a replica set member: {}", other.name()),
        ),
    };
    Some(reply)
}

fn not_initialized() -> Value {
    error_reply(
        codes::NOT_YET_INITIALIZED,
        "NotYetInitialized",
        "no replset config has been received",
    )
}

fn not_primary() -> Value {
    error_reply(codes::NOT_WRITABLE_PRIMARY, "NotWritablePrimary", "not primary")
}

fn hello(world: &World, addr: &HostAddr, server: &Server) -> HelloReply {
    let Some(config) = server.config() else {
        return HelloReply::default();
    };
    let me = world.self_member(addr, config);
    HelloReply {
        is_writable_primary: server.state == MemberState::Primary,
        secondary: server.state == MemberState::Secondary,
        arbiter_only: server.state == MemberState::Arbiter,
        set_name: me.map(|_| config.id.clone()),
        set_version: Some(config.version),
        primary: server.primary_host.clone(),
        me: me.map(|m| m.host.clone()),
        hosts: config
            .members
            .iter()
            .filter(|m| !m.arbiter_only && !m.hidden)
            .map(|m| m.host.clone())
            .collect(),
        msg: None,
    }
}

fn initiate(world: &mut World, addr: &HostAddr, config: ReplSetConfig) -> Value {
    let Some(server) = world.nodes.get(addr).and_then(|n| n.server()) else {
        return not_initialized();
    };
    if server.config().is_some() {
        return error_reply(codes::ALREADY_INITIALIZED, "AlreadyInitialized", "already initialized");
    }
    if server.set_name.as_deref() != Some(config.id.as_str()) {
        return invalid_config(format!(
            "set name {} does not match --replSet {}",
            config.id,
            server.set_name.as_deref().unwrap_or("(none)")
        ));
    }
    if world.self_member(addr, &config).is_none() {
        return invalid_config("no member of the config refers to this node".to_owned());
    }
    if let Some(server) = world.nodes.get_mut(addr).and_then(|n| n.server_mut()) {
        server.durable.config = Some(config);
        server.dirty = true;
    }
    ok_reply(json!({}))
}

fn invalid_config(message: String) -> Value {
    error_reply(codes::INVALID_REPLICA_SET_CONFIG, "InvalidReplicaSetConfig", message)
}

fn status(world: &World, addr: &HostAddr, now: Instant) -> ReplStatus {
    let Some(server) = world.live_server(addr, now) else {
        return ReplStatus {
            set: String::new(),
            my_state: MemberState::Down,
            term: 0,
            members: vec![],
        };
    };
    let Some(config) = server.config() else {
        return ReplStatus { set: String::new(), my_state: server.state, term: 0, members: vec![] };
    };
    let me = world.self_member(addr, config).map(|m| m.host.clone());
    let members = config
        .members
        .iter()
        .map(|m| {
            let is_self = me.as_ref() == Some(&m.host);
            let from = me.as_ref().unwrap_or(addr);
            let peer = if is_self {
                Some(server)
            } else {
                world
                    .reach(from, &m.host, now)
                    .and_then(|_| world.live_server(&world.resolve(&m.host), now))
            };
            match peer {
                Some(p) => MemberStatus {
                    id: m.id,
                    name: m.host.clone(),
                    health: 1,
                    state: p.state,
                    optime: (!m.arbiter_only).then(|| p.optime()),
                    is_self,
                },
                None => MemberStatus {
                    id: m.id,
                    name: m.host.clone(),
                    health: 0,
                    state: MemberState::Down,
                    optime: None,
                    is_self,
                },
            }
        })
        .collect();
    ReplStatus {
        set: config.id.clone(),
        my_state: server.state,
        term: server.durable.term,
        members,
    }
}

fn reconfig(
    world: &mut World,
    addr: &HostAddr,
    mut next: ReplSetConfig,
    force: bool,
    now: Instant,
) -> Value {
    let Some(server) = world.live_server(addr, now) else {
        return not_initialized();
    };
    let Some(current) = server.config() else {
        return not_initialized();
    };
    if !force && server.state != MemberState::Primary {
        return not_primary();
    }
    if next.id != current.id {
        return invalid_config(format!("cannot change set name from {} to {}", current.id, next.id));
    }
    if next.version <= current.version {
        return invalid_config(format!(
            "new config version {} must be greater than {}",
            next.version, current.version
        ));
    }
    if !force {
        let changed = voter_changes(current, &next);
        if changed > 1 {
            return error_reply(
                codes::NEW_REPLICA_SET_CONFIGURATION_INCOMPATIBLE,
                "NewReplicaSetConfigurationIncompatible",
                format!("only one voting member may be added or removed per reconfig, got {changed}"),
            );
        }
        if world.self_member(addr, &next).is_none() {
            return invalid_config("the primary must stay in the config".to_owned());
        }
    }
    next.term = server.durable.term;
    let in_config = world.self_member(addr, &next).is_some();
    if let Some(server) = world.live_server_mut(addr, now) {
        server.durable.config = Some(next);
        server.dirty = true;
        if !in_config {
            server.state = MemberState::Removed;
        }
    }
    ok_reply(json!({}))
}

/// Voting members added or removed, matched by host.
fn voter_changes(old: &ReplSetConfig, new: &ReplSetConfig) -> usize {
    let voters = |c: &ReplSetConfig| -> BTreeSet<HostAddr> {
        c.voting_members().map(|m| m.host.clone()).collect()
    };
    let (before, after) = (voters(old), voters(new));
    before.symmetric_difference(&after).count()
}

fn step_down(
    world: &mut World,
    addr: &HostAddr,
    secs: Duration,
    force: bool,
    now: Instant,
) -> Option<Value> {
    let server = world.live_server(addr, now)?;
    if server.state != MemberState::Primary {
        return Some(not_primary());
    }
    let Some(config) = server.config().cloned() else {
        return Some(not_initialized());
    };
    let me = world.self_member(addr, &config).map(|m| m.host.clone())?;
    let optime = server.optime();
    let caught_up = config.members.iter().filter(|m| m.is_electable() && m.host != me).any(|m| {
        world.reach(&me, &m.host, now).is_some()
            && world.live_server(&world.resolve(&m.host), now).is_some_and(|s| s.optime() >= optime)
    });
    if !force && !caught_up {
        return Some(error_reply(
            codes::EXCEEDED_TIME_LIMIT,
            "ExceededTimeLimit",
            "no electable secondary caught up",
        ));
    }

    if let Some(node) = world.nodes.get(addr) {
        node.proc.log(format!("[{}] stepping down for {secs:?}", node.name));
    }
    if let Some(server) = world.live_server_mut(addr, now) {
        server.state = MemberState::Secondary;
        server.primary_since = None;
        server.primary_host = None;
        server.frozen_until = Some(now + secs);
    }
    // The others should not wait out an election timeout.
    for m in &config.members {
        let target = world.resolve(&m.host);
        if let Some(peer) = world.live_server_mut(&target, now) {
            peer.last_heard_primary = None;
            peer.primary_host = None;
        }
    }
    None
}

fn step_up(world: &mut World, addr: &HostAddr, now: Instant) -> Value {
    let Some(server) = world.live_server(addr, now) else {
        return not_initialized();
    };
    match server.state {
        MemberState::Primary => return ok_reply(json!({})),
        MemberState::Secondary => {}
        state => {
            return error_reply(
                codes::NOT_PRIMARY_OR_SECONDARY,
                "NotPrimaryOrSecondary",
                format!("cannot step up from {state}"),
            );
        }
    }
    let Some(config) = server.config().cloned() else {
        return not_initialized();
    };
    let Some(me) = world.self_member(addr, &config).cloned() else {
        return invalid_config("not a member of the config".to_owned());
    };
    if !me.is_electable() {
        return error_reply(codes::OPERATION_FAILED, "OperationFailed", "member is not electable");
    }
    let peers = peers(world, &config, now);
    let Some(idx) = peers.iter().position(|p| p.member.id == me.id) else {
        return not_initialized();
    };
    if votes(world, &peers, idx, true, now) < config.majority() {
        return error_reply(
            codes::CONFLICTING_OPERATION_IN_PROGRESS,
            "ConflictingOperationInProgress",
            "election lost: not enough votes",
        );
    }
    elect(world, &peers, idx, now);
    ok_reply(json!({}))
}

fn freeze(world: &mut World, addr: &HostAddr, secs: u64, now: Instant) -> Value {
    let Some(server) = world.live_server_mut(addr, now) else {
        return not_initialized();
    };
    if server.state == MemberState::Primary {
        return error_reply(codes::OPERATION_FAILED, "OperationFailed", "cannot freeze a primary");
    }
    server.frozen_until = (secs > 0).then(|| now + Duration::from_secs(secs));
    ok_reply(json!({}))
}

fn append_note(world: &mut World, addr: &HostAddr, now: Instant) -> Value {
    let Some(server) = world.live_server_mut(addr, now) else {
        return not_initialized();
    };
    if server.state != MemberState::Primary {
        return not_primary();
    }
    let optime = server.write(now);
    ok_reply(json!({ "optime": optime }))
}

/// A member of a config that is up, answering, and shares the set name.
struct Peer {
    member: MemberConfig,
    addr: HostAddr,
    state: MemberState,
    optime: OpTime,
    term: i64,
    frozen: bool,
    last_heard: Option<Instant>,
    /// Index of a primary this peer can reach.
    sees_primary: Option<usize>,
}

fn peers(world: &World, config: &ReplSetConfig, now: Instant) -> Vec<Peer> {
    let mut peers: Vec<Peer> = config
        .members
        .iter()
        .filter_map(|m| {
            let addr = world.resolve(&m.host);
            let s = world.live_server(&addr, now)?;
            if s.set_name.as_deref() != Some(config.id.as_str()) || s.config().is_none() {
                return None;
            }
            Some(Peer {
                member: m.clone(),
                addr,
                state: s.state,
                optime: s.optime(),
                term: s.durable.term,
                frozen: s.is_frozen(now),
                last_heard: s.last_heard_primary,
                sees_primary: None,
            })
        })
        .collect();
    for i in 0..peers.len() {
        peers[i].sees_primary = (0..peers.len()).find(|&j| {
            j != i
                && peers[j].state == MemberState::Primary
                && world.reach(&peers[i].member.host, &peers[j].member.host, now).is_some()
        });
    }
    peers
}

/// Votes `peers[idx]` would collect right now. Voters refuse a candidate that
/// is behind them, and refuse while they can still see a primary unless
/// `forced` (a stepUp, which the primary yields to).
fn votes(world: &World, peers: &[Peer], idx: usize, forced: bool, now: Instant) -> usize {
    let cand = &peers[idx];
    peers
        .iter()
        .enumerate()
        .filter(|(j, v)| {
            v.member.votes > 0
                && (*j == idx
                    || (world.reach(&cand.member.host, &v.member.host, now).is_some()
                        && (forced || v.sees_primary.is_none())
                        && (v.member.arbiter_only || v.optime <= cand.optime)))
        })
        .count()
}

/// Make `peers[idx]` primary in a new term and tell everyone it can reach.
fn elect(world: &mut World, peers: &[Peer], idx: usize, now: Instant) {
    let winner = &peers[idx];
    let term = peers.iter().map(|p| p.term).max().unwrap_or(0) + 1;
    for (j, p) in peers.iter().enumerate() {
        let reachable = j == idx || world.reach(&winner.member.host, &p.member.host, now).is_some();
        let Some(node) = world.nodes.get_mut(&p.addr) else { continue };
        let (proc, name) = (Arc::clone(&node.proc), node.name.clone());
        let Some(s) = node.server_mut() else { continue };
        if j == idx {
            s.state = MemberState::Primary;
            s.durable.term = term;
            s.primary_host = Some(winner.member.host.clone());
            s.primary_since = Some(now);
            s.write(now);
            proc.log(format!("[{name}] transition to PRIMARY in term {term}"));
        } else if reachable {
            if s.state == MemberState::Primary {
                s.state = MemberState::Secondary;
                s.primary_since = None;
                proc.log(format!("[{name}] stepping down for term {term}"));
            }
            s.durable.term = term;
            s.primary_host = Some(winner.member.host.clone());
            s.last_heard_primary = Some(now);
            s.dirty = true;
        }
    }
    tracing::debug!(host = %winner.member.host, term, "simulated election won");
}

/// One heartbeat round for every replica set in the world.
pub(crate) fn tick(world: &mut World, now: Instant) {
    propagate_configs(world, now);

    let mut sets: Vec<ReplSetConfig> = Vec::new();
    for node in world.nodes.values().filter(|n| n.is_ready(now)) {
        let Some(config) = node.server().and_then(Server::config) else { continue };
        match sets.iter_mut().find(|c| c.id == config.id) {
            Some(c) if config.is_newer_than(c) => *c = config.clone(),
            Some(_) => {}
            None => sets.push(config.clone()),
        }
    }
    for config in &sets {
        tick_set(world, config, now);
    }
}

/// Push each member's config to reachable members holding an older one.
fn propagate_configs(world: &mut World, now: Instant) {
    let mut updates: Vec<(HostAddr, ReplSetConfig)> = Vec::new();
    for (addr, node) in &world.nodes {
        if !node.is_ready(now) {
            continue;
        }
        let Some(config) = node.server().and_then(Server::config) else { continue };
        let Some(me) = world.self_member(addr, config) else { continue };
        for m in &config.members {
            let target = world.resolve(&m.host);
            if &target == addr || world.link(&me.host, &m.host, now).is_none() {
                continue;
            }
            let Some(peer) = world.live_server(&target, now) else { continue };
            if peer.set_name.as_deref() != Some(config.id.as_str()) {
                continue;
            }
            let stale = peer.config().is_none_or(|c| config.is_newer_than(c));
            if stale {
                updates.push((target, config.clone()));
            }
        }
    }
    for (addr, config) in updates {
        if let Some(s) = world.live_server_mut(&addr, now)
            && s.config().is_none_or(|c| config.is_newer_than(c))
        {
            s.durable.term = s.durable.term.max(config.term);
            s.durable.config = Some(config);
            s.dirty = true;
        }
    }
}

fn tick_set(world: &mut World, config: &ReplSetConfig, now: Instant) {
    let timeout = Duration::from_millis(config.settings.election_timeout_millis);

    // Roles follow the config each member holds.
    for m in &config.members {
        let addr = world.resolve(&m.host);
        let in_own = world
            .live_server(&addr, now)
            .and_then(Server::config)
            .is_some_and(|c| world.self_member(&addr, c).is_some());
        if let Some(s) = world.live_server_mut(&addr, now) {
            match (s.state, in_own, m.arbiter_only) {
                (_, false, _) => s.state = MemberState::Removed,
                (MemberState::Startup | MemberState::Removed | MemberState::Down, true, true) => {
                    s.state = MemberState::Arbiter
                }
                (MemberState::Startup | MemberState::Removed | MemberState::Down, true, false) => {
                    s.state = MemberState::Secondary
                }
                _ => {}
            }
        }
    }

    let peers = peers(world, config, now);

    // Primaries without a majority, or behind a newer term, step down.
    for (i, p) in peers.iter().enumerate() {
        if p.state != MemberState::Primary {
            continue;
        }
        let reachable: Vec<&Peer> = peers
            .iter()
            .filter(|v| world.reach(&p.member.host, &v.member.host, now).is_some())
            .collect();
        let voters = reachable.iter().filter(|v| v.member.votes > 0).count();
        let newer_term = reachable.iter().any(|v| v.term > p.term);
        if voters < config.majority() || newer_term {
            if let Some(node) = world.nodes.get_mut(&peers[i].addr)
                && let Some(s) = node.server_mut()
            {
                s.state = MemberState::Secondary;
                s.primary_since = None;
                s.primary_host = None;
                node.proc.log(format!("[{}] stepping down: lost majority", node.name));
            }
        }
    }
    let peers = self::peers(world, config, now);

    // Heartbeats from the primary, and replication.
    for p in &peers {
        let Some(j) = p.sees_primary else {
            if p.state != MemberState::Primary
                && let Some(s) = world.live_server_mut(&p.addr, now)
            {
                s.primary_host = None;
            }
            continue;
        };
        let primary = &peers[j];
        let delay = world.reach(&p.member.host, &primary.member.host, now).unwrap_or_default();
        let paused = world.nodes.get(&p.addr).is_some_and(|n| world.paused.contains(&n.name));
        let target = if p.member.arbiter_only || paused {
            None
        } else {
            let source = world.live_server(&primary.addr, now);
            source.and_then(|s| {
                if delay.is_zero() { Some(s.optime()) } else { s.optime_as_of(now - delay) }
            })
        };
        if let Some(s) = world.live_server_mut(&p.addr, now) {
            s.last_heard_primary = Some(now);
            s.primary_host = Some(primary.member.host.clone());
            if s.durable.term < primary.term {
                s.durable.term = primary.term;
                s.dirty = true;
            }
            match target {
                Some(t) if t > s.optime() => s.apply(now, t),
                // Entries the primary never saw are rolled back.
                _ if s.optime() > primary.optime && !p.member.arbiter_only => {
                    s.apply(now, primary.optime)
                }
                _ => {}
            }
        }
    }

    if world.held_elections.contains(&config.id) {
        return;
    }
    // Candidates that can still see a primary never run, so this only
    // elects on the side of a partition that lost its primary.
    if run_election(world, &peers, config, timeout, now) {
        return;
    }
    let primaries: Vec<usize> =
        (0..peers.len()).filter(|&i| peers[i].state == MemberState::Primary).collect();
    if let [p] = primaries.as_slice() {
        priority_takeover(world, &peers, *p, config, timeout, now);
    }
}

fn run_election(
    world: &mut World,
    peers: &[Peer],
    config: &ReplSetConfig,
    timeout: Duration,
    now: Instant,
) -> bool {
    let best = peers
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            p.member.is_electable()
                && p.state == MemberState::Secondary
                && !p.frozen
                && p.sees_primary.is_none()
                && p.last_heard.is_none_or(|at| now.duration_since(at) >= timeout)
        })
        .filter(|(i, _)| votes(world, peers, *i, false, now) >= config.majority())
        .max_by(|(_, a), (_, b)| {
            a.member
                .priority
                .total_cmp(&b.member.priority)
                .then(a.optime.cmp(&b.optime))
                .then(b.member.id.cmp(&a.member.id))
        })
        .map(|(i, _)| i);
    match best {
        Some(i) => {
            elect(world, peers, i, now);
            true
        }
        None => false,
    }
}

/// A reachable, caught-up member with a higher priority than the primary
/// takes over once the primary has served an election timeout.
fn priority_takeover(
    world: &mut World,
    peers: &[Peer],
    primary: usize,
    config: &ReplSetConfig,
    timeout: Duration,
    now: Instant,
) {
    let p = &peers[primary];
    let served = world
        .live_server(&p.addr, now)
        .and_then(|s| s.primary_since)
        .is_some_and(|since| now.duration_since(since) >= timeout);
    if !served {
        return;
    }
    let challenger = peers
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            c.member.is_electable()
                && c.member.priority > p.member.priority
                && !c.frozen
                && c.optime >= p.optime
                && world.reach(&c.member.host, &p.member.host, now).is_some()
        })
        .filter(|(i, _)| votes(world, peers, *i, true, now) >= config.majority())
        .max_by(|(_, a), (_, b)| a.member.priority.total_cmp(&b.member.priority))
        .map(|(i, _)| i);
    if let Some(i) = challenger {
        elect(world, peers, i, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hosts: &[(u16, u32)]) -> ReplSetConfig {
        ReplSetConfig {
            id: "rs0".into(),
            version: 1,
            term: 0,
            protocol_version: 1,
            configsvr: false,
            members: hosts
                .iter()
                .enumerate()
                .map(|(i, (port, votes))| MemberConfig {
                    id: i as u32,
                    host: HostAddr::localhost(*port),
                    priority: 1.0,
                    votes: *votes,
                    arbiter_only: false,
                    hidden: false,
                })
                .collect(),
            settings: Default::default(),
        }
    }

    #[test]
    fn one_voter_change_is_allowed() {
        let old = config(&[(1, 1), (2, 1), (3, 1)]);
        assert_eq!(voter_changes(&old, &config(&[(1, 1), (2, 1), (3, 1), (4, 1)])), 1);
        assert_eq!(voter_changes(&old, &config(&[(1, 1), (2, 1), (3, 1), (4, 0)])), 0);
        assert_eq!(voter_changes(&old, &config(&[(1, 1), (4, 1), (5, 1)])), 4);
    }
}
