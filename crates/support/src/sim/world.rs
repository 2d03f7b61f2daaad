use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleet_config::{HostAddr, LaunchOptions};
use fleet_harness::admin::protocol::{MemberConfig, MemberState, OpTime, ReplSetConfig};
use fleet_harness::{ExitInfo, ProcessRole};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use super::router::Catalog;

const OUTPUT_LINES: usize = 500;
const OPLOG_HISTORY: usize = 4096;

/// Exit status and output of one launch. Shared between the world and the
/// `ServerProcess` handed to the harness.
pub(crate) struct ProcSlot {
    pub pid: u32,
    pub exit: watch::Sender<Option<ExitInfo>>,
    pub output: Mutex<VecDeque<String>>,
}

impl ProcSlot {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            exit: watch::Sender::new(None),
            output: Mutex::new(VecDeque::new()),
        })
    }

    pub fn exited(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn finish(&self, exit: ExitInfo) {
        self.exit.send_if_modified(|e| {
            if e.is_some() {
                return false;
            }
            *e = Some(exit);
            true
        });
    }

    pub fn log(&self, line: impl Into<String>) {
        let mut out = self.output.lock();
        if out.len() == OUTPUT_LINES {
            out.pop_front();
        }
        out.push_back(line.into());
    }
}

/// What a member keeps in `storage.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Durable {
    pub config: Option<ReplSetConfig>,
    pub term: i64,
    pub last_applied: OpTime,
}

impl Durable {
    fn path(dbpath: &Path) -> PathBuf {
        dbpath.join("storage.json")
    }

    pub fn load(dbpath: &Path) -> Self {
        std::fs::read(Self::path(dbpath))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, dbpath: &Path) {
        let result = serde_json::to_vec_pretty(self)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(Self::path(dbpath), bytes));
        if let Err(e) = result {
            tracing::warn!(path = %dbpath.display(), error = %e, "could not persist member state");
        }
    }
}

pub(crate) struct Server {
    pub dbpath: Option<PathBuf>,
    pub set_name: Option<String>,
    pub durable: Durable,
    pub state: MemberState,
    /// `(written, optime)` for entries this member wrote or applied.
    pub oplog: VecDeque<(Instant, OpTime)>,
    pub last_heard_primary: Option<Instant>,
    pub primary_host: Option<HostAddr>,
    pub primary_since: Option<Instant>,
    pub frozen_until: Option<Instant>,
    pub dirty: bool,
}

impl Server {
    pub fn new(dbpath: Option<PathBuf>, set_name: Option<String>) -> Self {
        let durable = dbpath.as_deref().map(Durable::load).unwrap_or_default();
        Self {
            dbpath,
            set_name,
            durable,
            state: MemberState::Startup,
            oplog: VecDeque::new(),
            last_heard_primary: None,
            primary_host: None,
            primary_since: None,
            frozen_until: None,
            dirty: false,
        }
    }

    pub fn config(&self) -> Option<&ReplSetConfig> {
        self.durable.config.as_ref()
    }

    pub fn optime(&self) -> OpTime {
        self.durable.last_applied
    }

    pub fn is_frozen(&self, now: Instant) -> bool {
        self.frozen_until.is_some_and(|until| until > now)
    }

    /// Write one entry in the current term.
    pub fn write(&mut self, now: Instant) -> OpTime {
        let next = OpTime::new(self.durable.term, self.durable.last_applied.ts + 1);
        self.apply(now, next);
        next
    }

    pub fn apply(&mut self, now: Instant, optime: OpTime) {
        self.durable.last_applied = optime;
        if self.oplog.len() == OPLOG_HISTORY {
            self.oplog.pop_front();
        }
        self.oplog.push_back((now, optime));
        self.dirty = true;
    }

    /// The newest entry written at or before `cutoff`.
    pub fn optime_as_of(&self, cutoff: Instant) -> Option<OpTime> {
        self.oplog.iter().rev().find(|(at, _)| *at <= cutoff).map(|(_, op)| *op)
    }

    pub fn flush(&mut self) {
        if let (true, Some(dbpath)) = (self.dirty, self.dbpath.as_deref()) {
            self.durable.save(dbpath);
        }
        self.dirty = false;
    }
}

pub(crate) struct Router {
    /// Name of the config server set, from `--configdb set/hosts`.
    pub config_set: String,
}

#[derive(Default)]
pub(crate) struct Bridge {
    pub dest: Option<HostAddr>,
    pub rejected: HashSet<HostAddr>,
    pub delays: HashMap<HostAddr, Duration>,
}

pub(crate) enum NodeKind {
    Server(Server),
    Router(Router),
    Bridge(Bridge),
}

pub(crate) struct Node {
    pub name: String,
    pub role: ProcessRole,
    pub options: LaunchOptions,
    pub proc: Arc<ProcSlot>,
    pub ready_at: Instant,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_up(&self) -> bool {
        self.proc.exited().is_none()
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.is_up() && now >= self.ready_at
    }

    pub fn server(&self) -> Option<&Server> {
        match &self.kind {
            NodeKind::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn server_mut(&mut self) -> Option<&mut Server> {
        match &mut self.kind {
            NodeKind::Server(s) => Some(s),
            _ => None,
        }
    }

    /// Stop the node. Returns `false` if it had already exited.
    pub fn exit(&mut self, exit: ExitInfo, why: &str) -> bool {
        if !self.is_up() {
            return false;
        }
        if let NodeKind::Server(s) = &mut self.kind {
            s.state = MemberState::Down;
            s.primary_since = None;
            s.flush();
        }
        self.proc.log(format!("[{}] {why} ({exit})", self.name));
        self.proc.finish(exit);
        true
    }
}

/// Knobs for the simulated fleet.
#[derive(Debug, Clone)]
pub struct SimSettings {
    pub tick: Duration,
    /// Time between launch and the first answered command.
    pub startup_delay: Duration,
    pub migration_delay: Duration,
    pub balancer_interval: Duration,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            startup_delay: Duration::from_millis(20),
            migration_delay: Duration::from_millis(50),
            balancer_interval: Duration::from_millis(100),
        }
    }
}

pub(crate) struct World {
    pub settings: SimSettings,
    /// Keyed by listen address.
    pub nodes: HashMap<HostAddr, Node>,
    /// Sharding metadata, keyed by config server set name.
    pub catalogs: HashMap<String, Catalog>,
    pub fail_startup: HashSet<String>,
    pub paused: HashSet<String>,
    /// Replica sets whose members never run for election.
    pub held_elections: HashSet<String>,
    /// Shard names routers refuse to add.
    pub refused_shards: HashSet<String>,
    pub next_pid: u32,
}

impl World {
    pub fn new(settings: SimSettings) -> Self {
        Self {
            settings,
            nodes: HashMap::new(),
            catalogs: HashMap::new(),
            fail_startup: HashSet::new(),
            paused: HashSet::new(),
            held_elections: HashSet::new(),
            refused_shards: HashSet::new(),
            next_pid: 40000,
        }
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.name == name && n.is_up())
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.values_mut().find(|n| n.name == name && n.is_up())
    }

    /// A server that is up and answering.
    pub fn live_server(&self, addr: &HostAddr, now: Instant) -> Option<&Server> {
        self.nodes.get(addr).filter(|n| n.is_ready(now)).and_then(Node::server)
    }

    pub fn live_server_mut(&mut self, addr: &HostAddr, now: Instant) -> Option<&mut Server> {
        self.nodes.get_mut(addr).filter(|n| n.is_ready(now)).and_then(Node::server_mut)
    }

    /// The server behind `host`: the host itself, or a bridge's destination.
    pub fn resolve(&self, host: &HostAddr) -> HostAddr {
        match self.nodes.get(host).map(|n| &n.kind) {
            Some(NodeKind::Bridge(Bridge { dest: Some(dest), .. })) => dest.clone(),
            _ => host.clone(),
        }
    }

    /// The member entry of `config` that refers to the server at `addr`.
    pub fn self_member<'a>(
        &self,
        addr: &HostAddr,
        config: &'a ReplSetConfig,
    ) -> Option<&'a MemberConfig> {
        config.members.iter().find(|m| &m.host == addr || &self.resolve(&m.host) == addr)
    }

    /// Can the member advertised as `from` send to the member advertised as
    /// `to`? Returns the added latency when it can.
    pub fn link(&self, from: &HostAddr, to: &HostAddr, now: Instant) -> Option<Duration> {
        let mut delay = Duration::ZERO;
        let target = match self.nodes.get(to) {
            Some(node) => match &node.kind {
                NodeKind::Bridge(bridge) => {
                    if !node.is_ready(now) || bridge.rejected.contains(from) {
                        return None;
                    }
                    delay = bridge.delays.get(from).copied().unwrap_or_default();
                    bridge.dest.clone()?
                }
                _ => to.clone(),
            },
            None => return None,
        };
        self.live_server(&target, now).map(|_| delay)
    }

    /// Both directions work. The latency is the slower direction.
    pub fn reach(&self, a: &HostAddr, b: &HostAddr, now: Instant) -> Option<Duration> {
        if a == b {
            return Some(Duration::ZERO);
        }
        Some(self.link(a, b, now)?.max(self.link(b, a, now)?))
    }

    pub fn flush(&mut self) {
        for node in self.nodes.values_mut() {
            if let Some(server) = node.server_mut() {
                server.flush();
            }
        }
    }
}
