//! Request and reply shapes of the administrative command protocol.
//!
//! Every reply is a JSON object with an `ok` field. Failures carry `ok: 0`
//! plus `code`, `codeName` and `errmsg`.

use std::fmt;

use fleet_config::{HostAddr, ReplSetSettings, TopologyConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AdminCommand {
    Ping,
    Hello,
    ReplSetInitiate { config: ReplSetConfig },
    ReplSetGetStatus,
    ReplSetGetConfig,
    ReplSetReconfig { config: ReplSetConfig, force: bool },
    ReplSetStepDown { secs: u64, force: bool },
    ReplSetStepUp,
    ReplSetFreeze { secs: u64 },
    AppendOplogNote { note: String },

    AddShard { name: String, connection: String },
    ListShards,
    ShardCollection { ns: String, key: String },
    Split { ns: String, middle: i64 },
    MoveChunk { ns: String, find: i64, to: String },
    ListChunks { ns: String },
    BalancerStart,
    BalancerStop,
    BalancerStatus,

    // Only bridges answer these.
    RejectConnectionsFrom { host: HostAddr },
    AcceptConnectionsFrom { host: HostAddr },
    DelayMessagesFrom { host: HostAddr, delay_ms: u64 },
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::Ping => "ping",
            AdminCommand::Hello => "hello",
            AdminCommand::ReplSetInitiate { .. } => "replSetInitiate",
            AdminCommand::ReplSetGetStatus => "replSetGetStatus",
            AdminCommand::ReplSetGetConfig => "replSetGetConfig",
            AdminCommand::ReplSetReconfig { .. } => "replSetReconfig",
            AdminCommand::ReplSetStepDown { .. } => "replSetStepDown",
            AdminCommand::ReplSetStepUp => "replSetStepUp",
            AdminCommand::ReplSetFreeze { .. } => "replSetFreeze",
            AdminCommand::AppendOplogNote { .. } => "appendOplogNote",
            AdminCommand::AddShard { .. } => "addShard",
            AdminCommand::ListShards => "listShards",
            AdminCommand::ShardCollection { .. } => "shardCollection",
            AdminCommand::Split { .. } => "split",
            AdminCommand::MoveChunk { .. } => "moveChunk",
            AdminCommand::ListChunks { .. } => "listChunks",
            AdminCommand::BalancerStart => "balancerStart",
            AdminCommand::BalancerStop => "balancerStop",
            AdminCommand::BalancerStatus => "balancerStatus",
            AdminCommand::RejectConnectionsFrom { .. } => "rejectConnectionsFrom",
            AdminCommand::AcceptConnectionsFrom { .. } => "acceptConnectionsFrom",
            AdminCommand::DelayMessagesFrom { .. } => "delayMessagesFrom",
        }
    }

    pub fn is_bridge_command(&self) -> bool {
        matches!(
            self,
            AdminCommand::RejectConnectionsFrom { .. }
                | AdminCommand::AcceptConnectionsFrom { .. }
                | AdminCommand::DelayMessagesFrom { .. }
        )
    }
}

/// Numeric error codes used by the collaborator.
pub mod codes {
    pub const INTERNAL_ERROR: i32 = 1;
    pub const ILLEGAL_OPERATION: i32 = 20;
    pub const ALREADY_INITIALIZED: i32 = 23;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const COMMAND_NOT_FOUND: i32 = 59;
    pub const SHARD_NOT_FOUND: i32 = 70;
    pub const NODE_NOT_FOUND: i32 = 74;
    pub const SHUTDOWN_IN_PROGRESS: i32 = 91;
    pub const INVALID_REPLICA_SET_CONFIG: i32 = 93;
    pub const NOT_YET_INITIALIZED: i32 = 94;
    pub const OPERATION_FAILED: i32 = 96;
    pub const NEW_REPLICA_SET_CONFIGURATION_INCOMPATIBLE: i32 = 103;
    pub const CONFIGURATION_IN_PROGRESS: i32 = 109;
    pub const CONFLICTING_OPERATION_IN_PROGRESS: i32 = 117;
    pub const FAILED_TO_SATISFY_READ_PREFERENCE: i32 = 133;
    pub const PRIMARY_STEPPED_DOWN: i32 = 189;
    pub const EXCEEDED_TIME_LIMIT: i32 = 262;
    pub const CURRENT_CONFIG_NOT_COMMITTED_YET: i32 = 308;
    pub const NOT_WRITABLE_PRIMARY: i32 = 10107;
    pub const NOT_PRIMARY_OR_SECONDARY: i32 = 13436;
    pub const INTERRUPTED_DUE_TO_REPL_STATE_CHANGE: i32 = 11602;
}

/// Code names that mean "the set is changing under you, try again".
pub const TRANSIENT_CODE_NAMES: &[&str] = &[
    "NotWritablePrimary",
    "InterruptedDueToReplStateChange",
    "PrimarySteppedDown",
    "NotYetInitialized",
    "NodeNotFound",
    "ConfigurationInProgress",
    "CurrentConfigNotCommittedYet",
    "ShutdownInProgress",
    "FailedToSatisfyReadPreference",
    "ConflictingOperationInProgress",
];

/// Build a success reply from any serializable body.
pub fn ok_reply(body: impl Serialize) -> Value {
    match serde_json::to_value(body) {
        Ok(Value::Object(mut map)) => {
            map.insert("ok".to_owned(), Value::from(1));
            Value::Object(map)
        }
        Ok(Value::Null) => serde_json::json!({ "ok": 1 }),
        Ok(other) => serde_json::json!({ "ok": 1, "value": other }),
        Err(e) => error_reply(codes::INTERNAL_ERROR, "InternalError", e.to_string()),
    }
}

pub fn error_reply(code: i32, code_name: &str, errmsg: impl Into<String>) -> Value {
    serde_json::json!({ "ok": 0, "code": code, "codeName": code_name, "errmsg": errmsg.into() })
}

/// Replica set member states, serialized as the collaborator's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
    Recovering,
    Startup2,
    Unknown,
    Arbiter,
    Down,
    Rollback,
    Removed,
}

impl MemberState {
    pub fn code(self) -> u8 {
        match self {
            MemberState::Startup => 0,
            MemberState::Primary => 1,
            MemberState::Secondary => 2,
            MemberState::Recovering => 3,
            MemberState::Startup2 => 5,
            MemberState::Unknown => 6,
            MemberState::Arbiter => 7,
            MemberState::Down => 8,
            MemberState::Rollback => 9,
            MemberState::Removed => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Startup => "STARTUP",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Startup2 => "STARTUP2",
            MemberState::Unknown => "UNKNOWN",
            MemberState::Arbiter => "ARBITER",
            MemberState::Down => "DOWN",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Removed => "REMOVED",
        }
    }
}

impl From<u8> for MemberState {
    fn from(code: u8) -> Self {
        match code {
            0 => MemberState::Startup,
            1 => MemberState::Primary,
            2 => MemberState::Secondary,
            3 => MemberState::Recovering,
            5 => MemberState::Startup2,
            7 => MemberState::Arbiter,
            8 => MemberState::Down,
            9 => MemberState::Rollback,
            10 => MemberState::Removed,
            _ => MemberState::Unknown,
        }
    }
}

impl From<MemberState> for u8 {
    fn from(state: MemberState) -> Self {
        state.code()
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position in the replication log. Orders by term, then timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    #[serde(rename = "t")]
    pub term: i64,
    pub ts: u64,
}

impl OpTime {
    pub fn new(term: i64, ts: u64) -> Self {
        Self { term, ts }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ts: {}, t: {}}}", self.ts, self.term)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    #[serde(default)]
    pub is_writable_primary: bool,
    #[serde(default)]
    pub secondary: bool,
    #[serde(default)]
    pub arbiter_only: bool,
    #[serde(default)]
    pub set_name: Option<String>,
    #[serde(default)]
    pub set_version: Option<i64>,
    /// The member this node believes is primary.
    #[serde(default)]
    pub primary: Option<HostAddr>,
    #[serde(default)]
    pub me: Option<HostAddr>,
    #[serde(default)]
    pub hosts: Vec<HostAddr>,
    /// `"isdbgrid"` when the node is a router.
    #[serde(default)]
    pub msg: Option<String>,
}

impl HelloReply {
    pub fn is_router(&self) -> bool {
        self.msg.as_deref() == Some("isdbgrid")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplStatus {
    pub set: String,
    pub my_state: MemberState,
    pub term: i64,
    pub members: Vec<MemberStatus>,
}

impl ReplStatus {
    pub fn me(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.is_self)
    }

    pub fn primary(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.state == MemberState::Primary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    #[serde(rename = "_id")]
    pub id: u32,
    pub name: HostAddr,
    pub health: u8,
    pub state: MemberState,
    /// Last applied optime, absent when the member is unreachable.
    #[serde(default)]
    pub optime: Option<OpTime>,
    #[serde(default, rename = "self")]
    pub is_self: bool,
}

/// The replica set config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplSetConfig {
    #[serde(rename = "_id")]
    pub id: String,
    pub version: i64,
    #[serde(default)]
    pub term: i64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default)]
    pub configsvr: bool,
    pub members: Vec<MemberConfig>,
    #[serde(default)]
    pub settings: ReplSetConfigSettings,
}

fn default_protocol_version() -> u32 {
    1
}

impl ReplSetConfig {
    /// Version 1 config for `topology`. `hosts[i]` is the address other
    /// members use to reach `topology.members[i]`.
    pub fn from_topology(topology: &TopologyConfig, hosts: &[HostAddr]) -> Self {
        let members = topology
            .members
            .iter()
            .zip(hosts)
            .map(|(m, host)| MemberConfig {
                id: m.id,
                host: host.clone(),
                priority: m.priority,
                votes: m.votes,
                arbiter_only: m.arbiter,
                hidden: m.hidden,
            })
            .collect();
        Self {
            id: topology.name.clone(),
            version: 1,
            term: 0,
            protocol_version: 1,
            configsvr: topology.options.contains("configsvr"),
            members,
            settings: ReplSetConfigSettings::from(&topology.settings),
        }
    }

    pub fn member(&self, id: u32) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_by_host(&self, host: &HostAddr) -> Option<&MemberConfig> {
        self.members.iter().find(|m| &m.host == host)
    }

    pub fn voting_members(&self) -> impl Iterator<Item = &MemberConfig> {
        self.members.iter().filter(|m| m.votes > 0)
    }

    pub fn majority(&self) -> usize {
        self.voting_members().count() / 2 + 1
    }

    /// Configs are ordered by term first, then version.
    pub fn is_newer_than(&self, other: &ReplSetConfig) -> bool {
        (self.term, self.version) > (other.term, other.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberConfig {
    #[serde(rename = "_id")]
    pub id: u32,
    pub host: HostAddr,
    pub priority: f64,
    pub votes: u32,
    #[serde(default)]
    pub arbiter_only: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl MemberConfig {
    pub fn is_electable(&self) -> bool {
        !self.arbiter_only && !self.hidden && self.votes > 0 && self.priority > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplSetConfigSettings {
    pub election_timeout_millis: u64,
    pub heartbeat_interval_millis: u64,
    pub chaining_allowed: bool,
}

impl Default for ReplSetConfigSettings {
    fn default() -> Self {
        Self::from(&ReplSetSettings::default())
    }
}

impl From<&ReplSetSettings> for ReplSetConfigSettings {
    fn from(s: &ReplSetSettings) -> Self {
        Self {
            election_timeout_millis: s.election_timeout.as_millis() as u64,
            heartbeat_interval_millis: s.heartbeat_interval.as_millis() as u64,
            chaining_allowed: s.chaining_allowed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplSetConfigReply {
    pub config: ReplSetConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogNoteReply {
    pub optime: OpTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    #[serde(rename = "_id")]
    pub id: String,
    /// Connection string, `set/host:port,host:port`.
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardList {
    pub shards: Vec<ShardInfo>,
}

/// One end of a chunk range. Orders `MinKey < Value(_) < MaxKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyBound {
    MinKey,
    Value(i64),
    MaxKey,
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBound::MinKey => f.write_str("MinKey"),
            KeyBound::Value(v) => write!(f, "{v}"),
            KeyBound::MaxKey => f.write_str("MaxKey"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub ns: String,
    pub min: KeyBound,
    pub max: KeyBound,
    pub shard: String,
}

impl ChunkInfo {
    /// Chunks are half-open: `[min, max)`.
    pub fn contains(&self, key: i64) -> bool {
        self.min <= KeyBound::Value(key) && KeyBound::Value(key) < self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkList {
    pub chunks: Vec<ChunkInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerStatus {
    /// `"full"` or `"off"`.
    pub mode: String,
    pub in_balancer_round: bool,
    pub num_balancer_rounds: u64,
}
