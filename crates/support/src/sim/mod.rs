//! An in-process stand-in for the server, router and bridge binaries.
//!
//! [`SimFleet`] implements both [`Launcher`] and [`AdminTransport`], so a
//! [`Harness`](fleet_harness::Harness) built on it runs its real controllers
//! against simulated processes. Members elect primaries, replicate, persist
//! their term and config under `dbpath`, and honour bridge rules. A
//! background ticker drives heartbeats, elections, migrations and balancer
//! rounds on `tokio::time`, so paused-clock tests stay deterministic.

mod replset;
mod router;
mod world;

use std::sync::Arc;

use fleet_config::{HostAddr, LaunchOptions};
use fleet_harness::admin::protocol::{AdminCommand, MemberState, ok_reply};
use fleet_harness::{
    AdminError, AdminTransport, BoxFuture, ExitInfo, HarnessError, LaunchSpec, Launcher,
    ProcessRole, Result, ServerProcess, StopSignal,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use world::SimSettings;
use world::{Bridge, Node, NodeKind, ProcSlot, Router, Server, World};

const SIGKILL: i32 = 9;
const SIGABRT: i32 = 6;

pub struct SimFleet {
    world: Arc<Mutex<World>>,
    cancel: CancellationToken,
}

impl SimFleet {
    /// Create the fleet and start its ticker. Must be called inside a tokio
    /// runtime.
    pub fn new(settings: SimSettings) -> Arc<Self> {
        let period = settings.tick;
        let world = Arc::new(Mutex::new(World::new(settings)));
        let cancel = CancellationToken::new();

        let ticking = Arc::clone(&world);
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => step(&mut ticking.lock(), Instant::now()),
                }
            }
            tracing::trace!("sim ticker stopped");
        });

        Arc::new(Self { world, cancel })
    }

    /// Make launches of `name` exit immediately with status 1.
    pub fn fail_startup(&self, name: &str, fail: bool) {
        let mut world = self.world.lock();
        if fail {
            world.fail_startup.insert(name.to_owned());
        } else {
            world.fail_startup.remove(name);
        }
    }

    /// Abort the live process called `name`, as if it hit an assertion.
    /// Returns `false` if nothing by that name is running.
    pub fn crash(&self, name: &str) -> bool {
        let mut world = self.world.lock();
        world
            .find_mut(name)
            .is_some_and(|node| node.exit(ExitInfo::signal(SIGABRT), "fatal assertion"))
    }

    /// Stop (or resume) a member applying entries from its sync source.
    pub fn pause_replication(&self, name: &str, paused: bool) {
        let mut world = self.world.lock();
        if paused {
            world.paused.insert(name.to_owned());
        } else {
            world.paused.remove(name);
        }
    }

    /// Keep (or stop keeping) the members of `set` from running for
    /// election. A primary already in office is not affected.
    pub fn hold_elections(&self, set: &str, held: bool) {
        let mut world = self.world.lock();
        if held {
            world.held_elections.insert(set.to_owned());
        } else {
            world.held_elections.remove(set);
        }
    }

    /// Make routers answer `addShard` for `shard` with `OperationFailed`.
    pub fn refuse_shard(&self, shard: &str, refuse: bool) {
        let mut world = self.world.lock();
        if refuse {
            world.refused_shards.insert(shard.to_owned());
        } else {
            world.refused_shards.remove(shard);
        }
    }

    /// Write `count` entries on the primary of `set`. Returns how many were
    /// written, which is zero when the set has no live primary.
    pub fn write(&self, set: &str, count: usize) -> usize {
        let now = Instant::now();
        let mut world = self.world.lock();
        let Some(primary) = world.nodes.values_mut().filter(|n| n.is_ready(now)).find_map(|n| {
            n.server_mut().filter(|s| {
                s.set_name.as_deref() == Some(set)
                    && s.state == MemberState::Primary
            })
        }) else {
            return 0;
        };
        for _ in 0..count {
            primary.write(now);
        }
        count
    }

    /// Number of live simulated processes.
    pub fn live_processes(&self) -> usize {
        self.world.lock().nodes.values().filter(|n| n.is_up()).count()
    }

    /// Role and options of the live process called `name`, as last launched.
    pub fn launched_with(&self, name: &str) -> Option<(ProcessRole, LaunchOptions)> {
        let world = self.world.lock();
        let node = world.find(name)?;
        Some((node.role, node.options.clone()))
    }

    /// Hosts the live bridge called `name` currently rejects or delays,
    /// sorted. Empty when nothing by that name is a running bridge.
    pub fn bridge_rules(&self, name: &str) -> Vec<HostAddr> {
        let world = self.world.lock();
        let Some(NodeKind::Bridge(bridge)) = world.find(name).map(|n| &n.kind) else {
            return Vec::new();
        };
        let mut hosts: Vec<HostAddr> =
            bridge.rejected.iter().chain(bridge.delays.keys()).cloned().collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

impl Drop for SimFleet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn step(world: &mut World, now: Instant) {
    replset::tick(world, now);
    router::tick(world, now);
    world.flush();
}

impl Launcher for SimFleet {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerProcess>> {
        let spawn_err = |message: String| HarnessError::Spawn { name: spec.name.clone(), message };
        let now = Instant::now();
        let mut world = self.world.lock();

        if world.nodes.get(&spec.addr).is_some_and(Node::is_up) {
            return Err(spawn_err(format!("{}: address already in use", spec.addr)));
        }

        let kind = match spec.role {
            ProcessRole::Server => NodeKind::Server(Server::new(
                spec.dbpath.clone(),
                spec.options.get("replSet").map(str::to_owned),
            )),
            ProcessRole::Router => {
                let configdb = spec
                    .options
                    .get("configdb")
                    .ok_or_else(|| spawn_err("router needs --configdb".into()))?;
                let (set, _) = configdb
                    .split_once('/')
                    .ok_or_else(|| spawn_err(format!("bad --configdb {configdb}")))?;
                NodeKind::Router(Router { config_set: set.to_owned() })
            }
            ProcessRole::Bridge => {
                let dest = spec
                    .options
                    .get("dest")
                    .map(str::parse::<HostAddr>)
                    .transpose()
                    .map_err(spawn_err)?;
                NodeKind::Bridge(Bridge { dest, ..Bridge::default() })
            }
        };

        let pid = world.next_pid;
        world.next_pid += 1;
        let slot = ProcSlot::new(pid);
        slot.log(format!("[{}] listening on {}", spec.name, spec.addr));

        let mut node = Node {
            name: spec.name.clone(),
            role: spec.role,
            options: spec.options.clone(),
            proc: Arc::clone(&slot),
            ready_at: now + world.settings.startup_delay,
            kind,
        };
        if world.fail_startup.contains(&spec.name) {
            node.exit(ExitInfo::code(1), "fatal: simulated startup failure");
        }
        tracing::debug!(name = %spec.name, addr = %spec.addr, pid, "sim launch");
        world.nodes.insert(spec.addr.clone(), node);

        Ok(Box::new(SimProcess { world: Arc::clone(&self.world), addr: spec.addr.clone(), slot }))
    }
}

impl AdminTransport for SimFleet {
    fn call(
        &self,
        addr: &HostAddr,
        cmd: &AdminCommand,
    ) -> BoxFuture<'_, std::result::Result<Value, AdminError>> {
        let reply = dispatch(&mut self.world.lock(), addr, cmd, Instant::now());
        Box::pin(async move { reply })
    }
}

fn unreachable(addr: &HostAddr, message: &str) -> AdminError {
    AdminError::Unreachable { addr: addr.clone(), message: message.to_owned() }
}

fn dispatch(
    world: &mut World,
    addr: &HostAddr,
    cmd: &AdminCommand,
    now: Instant,
) -> std::result::Result<Value, AdminError> {
    let Some(node) = world.nodes.get_mut(addr).filter(|n| n.is_ready(now)) else {
        return Err(unreachable(addr, "connection refused"));
    };
    match &mut node.kind {
        NodeKind::Bridge(bridge) if cmd.is_bridge_command() => {
            match cmd {
                AdminCommand::RejectConnectionsFrom { host } => {
                    bridge.rejected.insert(host.clone());
                }
                AdminCommand::AcceptConnectionsFrom { host } => {
                    bridge.rejected.remove(host);
                }
                AdminCommand::DelayMessagesFrom { host, delay_ms: 0 } => {
                    bridge.delays.remove(host);
                }
                AdminCommand::DelayMessagesFrom { host, delay_ms } => {
                    let delay = std::time::Duration::from_millis(*delay_ms);
                    bridge.delays.insert(host.clone(), delay);
                }
                _ => {}
            }
            Ok(ok_reply(json!({})))
        }
        NodeKind::Bridge(bridge) => match bridge.dest.clone() {
            Some(dest) if dest != *addr => dispatch(world, &dest, cmd, now),
            _ => Err(unreachable(addr, "bridge has no destination")),
        },
        NodeKind::Router(_) => Ok(router::handle(world, addr, cmd, now)),
        NodeKind::Server(_) => replset::handle(world, addr, cmd, now)
            .ok_or_else(|| unreachable(addr, "connection closed by peer")),
    }
}

/// The harness's view of one simulated launch.
struct SimProcess {
    world: Arc<Mutex<World>>,
    addr: HostAddr,
    slot: Arc<ProcSlot>,
}

impl ServerProcess for SimProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.slot.pid)
    }

    fn signal(&self, signal: StopSignal) -> Result<()> {
        let (exit, why) = match signal {
            StopSignal::Graceful => (ExitInfo::code(0), "shutting down"),
            StopSignal::Kill => (ExitInfo::signal(SIGKILL), "killed"),
        };
        let mut world = self.world.lock();
        match world.nodes.get_mut(&self.addr) {
            Some(node) if Arc::ptr_eq(&node.proc, &self.slot) => {
                node.exit(exit, why);
            }
            _ => self.slot.finish(exit),
        }
        Ok(())
    }

    fn try_wait(&self) -> Result<Option<ExitInfo>> {
        Ok(self.slot.exited())
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<ExitInfo>> {
        let mut exit = self.slot.exit.subscribe();
        let gone = || HarnessError::ProcessNotFound { name: format!("pid {}", self.slot.pid) };
        Box::pin(async move {
            let info = *exit.wait_for(Option::is_some).await.map_err(|_| gone())?;
            info.ok_or_else(gone)
        })
    }

    fn output_tail(&self, lines: usize) -> Vec<String> {
        let out = self.slot.output.lock();
        out.iter().skip(out.len().saturating_sub(lines)).cloned().collect()
    }
}
