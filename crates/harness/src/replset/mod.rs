//! Replica set lifecycle: initiate, elections, replication, reconfig.
//!
//! A [`ReplicaSetHandle`] owns the member slots of one set. Controller
//! operations take it by `&mut`, so only one operation runs against a set at
//! a time.

mod elections;
mod lifecycle;
mod membership;
mod replication;

use std::fmt;

use fleet_config::{HostAddr, TopologyConfig};
use serde::Serialize;

use crate::admin::protocol::{HelloReply, ReplSetConfig};
use crate::admin::{Admin, AdminError};
use crate::error::{HarnessError, Result};
use crate::process::ProcessHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetState {
    Initializing,
    Converged,
    /// A fault was injected or a member was stopped.
    Degraded,
    TornDown,
}

impl fmt::Display for SetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetState::Initializing => "initializing",
            SetState::Converged => "converged",
            SetState::Degraded => "degraded",
            SetState::TornDown => "torn down",
        };
        f.write_str(s)
    }
}

/// One member's processes.
#[derive(Debug, Clone)]
pub struct MemberSlot {
    pub id: u32,
    pub server: ProcessHandle,
    pub bridge: Option<ProcessHandle>,
    /// Dropped from the config by a reconfig.
    pub removed: bool,
}

impl MemberSlot {
    /// The address other members use: the bridge when there is one.
    pub fn advertised(&self) -> &HostAddr {
        self.bridge.as_ref().map_or(self.server.addr(), |b| b.addr())
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaSetHandle {
    spec: TopologyConfig,
    current: TopologyConfig,
    config: ReplSetConfig,
    members: Vec<MemberSlot>,
    /// Member id of the last primary seen.
    primary: Option<u32>,
    state: SetState,
}

impl ReplicaSetHandle {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The topology the set was initiated with.
    pub fn spec(&self) -> &TopologyConfig {
        &self.spec
    }

    /// The topology after any reconfigs.
    pub fn topology(&self) -> &TopologyConfig {
        &self.current
    }

    /// The last config document the harness installed or read back.
    pub fn config(&self) -> &ReplSetConfig {
        &self.config
    }

    pub fn state(&self) -> SetState {
        self.state
    }

    /// Members still in the config, in slot order.
    pub fn members(&self) -> impl Iterator<Item = &MemberSlot> {
        self.members.iter().filter(|m| !m.removed)
    }

    /// Every slot, including removed members.
    pub fn all_slots(&self) -> &[MemberSlot] {
        &self.members
    }

    pub fn member(&self, id: u32) -> Result<&MemberSlot> {
        self.members
            .iter()
            .find(|m| m.id == id && !m.removed)
            .ok_or_else(|| HarnessError::MemberNotFound { set: self.name().to_owned(), id })
    }

    pub fn member_by_name(&self, name: &str) -> Option<&MemberSlot> {
        self.members().find(|m| m.name() == name)
    }

    /// The member the harness last saw as primary. Not a live check.
    pub fn last_known_primary(&self) -> Option<&MemberSlot> {
        self.primary.and_then(|id| self.members().find(|m| m.id == id))
    }

    pub fn is_arbiter(&self, id: u32) -> bool {
        self.current.member_by_id(id).is_some_and(|m| m.arbiter)
    }

    /// `name/host1,host2,...` over the advertised addresses.
    pub fn connection_string(&self) -> String {
        let hosts: Vec<String> = self.members().map(|m| m.advertised().to_string()).collect();
        format!("{}/{}", self.name(), hosts.join(","))
    }

    pub fn mark_degraded(&mut self) {
        if self.state != SetState::TornDown {
            self.state = SetState::Degraded;
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        match self.state {
            SetState::TornDown => Err(HarnessError::TornDown { set: self.name().to_owned() }),
            _ => Ok(()),
        }
    }

    fn remember_primary(&mut self, id: u32) {
        self.primary = Some(id);
    }
}

/// What one member says about itself.
#[derive(Debug, Clone)]
pub struct MemberView {
    pub id: u32,
    pub name: String,
    pub hello: std::result::Result<HelloReply, AdminError>,
}

impl MemberView {
    pub fn is_primary(&self) -> bool {
        self.hello.as_ref().is_ok_and(|h| h.is_writable_primary)
    }

    pub fn is_secondary(&self) -> bool {
        self.hello.as_ref().is_ok_and(|h| h.secondary)
    }

    pub fn is_arbiter(&self) -> bool {
        self.hello.as_ref().is_ok_and(|h| h.arbiter_only)
    }

    /// The primary this member believes in.
    pub fn primary(&self) -> Option<&HostAddr> {
        self.hello.as_ref().ok().and_then(|h| h.primary.as_ref())
    }
}

impl fmt::Display for MemberView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hello {
            Ok(h) if h.is_writable_primary => write!(f, "{}=PRIMARY", self.name),
            Ok(h) if h.secondary => write!(f, "{}=SECONDARY", self.name),
            Ok(h) if h.arbiter_only => write!(f, "{}=ARBITER", self.name),
            Ok(_) => write!(f, "{}=no role", self.name),
            Err(e) if e.is_network() => write!(f, "{}=unreachable", self.name),
            Err(e) => write!(f, "{}=error({})", self.name, e.code_name().unwrap_or("?")),
        }
    }
}

/// Render a survey as a one-line snapshot for logs and errors.
pub fn describe(views: &[MemberView]) -> String {
    views.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Forced reconfigs skip the primary and go to any reachable member.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconfigOptions {
    pub force: bool,
}

/// Drives replica sets through the admin protocol. Cheap to clone.
#[derive(Clone)]
pub struct ReplicaSetController {
    admin: Admin,
}

impl ReplicaSetController {
    pub fn new(admin: Admin) -> Self {
        Self { admin }
    }

    pub fn admin(&self) -> &Admin {
        &self.admin
    }

    /// Ask every member for `hello`, in slot order.
    pub async fn survey(&self, set: &ReplicaSetHandle) -> Vec<MemberView> {
        let mut views = Vec::new();
        for slot in set.members() {
            views.push(MemberView {
                id: slot.id,
                name: slot.name().to_owned(),
                hello: self.admin.hello(slot.server.addr()).await,
            });
        }
        views
    }
}

/// The single member reporting itself primary, if exactly one does.
fn sole_primary(views: &[MemberView]) -> std::result::Result<u32, String> {
    let primaries: Vec<&MemberView> = views.iter().filter(|v| v.is_primary()).collect();
    match primaries.as_slice() {
        [only] => Ok(only.id),
        [] => Err(format!("no primary: {}", describe(views))),
        _ => Err(format!("multiple primaries: {}", describe(views))),
    }
}

#[cfg(test)]
mod tests {
    use fleet_config::MemberSpec;

    use super::*;
    use crate::process::{ProcessId, ProcessRole};

    fn handle(name: &str, port: u16, role: ProcessRole) -> ProcessHandle {
        ProcessHandle {
            id: ProcessId(port as u64),
            manager: 1,
            name: name.into(),
            role,
            addr: HostAddr::localhost(port),
            dbpath: None,
        }
    }

    fn set(bridged: bool) -> ReplicaSetHandle {
        let spec = TopologyConfig::with_nodes("rs0", 2).member(MemberSpec::arbiter(2));
        let members: Vec<MemberSlot> = (0..3)
            .map(|id| MemberSlot {
                id,
                server: handle(&format!("rs0-{id}"), 20000 + id as u16, ProcessRole::Server),
                bridge: bridged.then(|| {
                    handle(&format!("rs0-{id}-bridge"), 21000 + id as u16, ProcessRole::Bridge)
                }),
                removed: false,
            })
            .collect();
        let hosts: Vec<HostAddr> = members.iter().map(|m| m.advertised().clone()).collect();
        ReplicaSetHandle {
            config: ReplSetConfig::from_topology(&spec, &hosts),
            current: spec.clone(),
            spec,
            members,
            primary: None,
            state: SetState::Converged,
        }
    }

    fn view(id: u32, hello: std::result::Result<HelloReply, AdminError>) -> MemberView {
        MemberView { id, name: format!("rs0-{id}"), hello }
    }

    fn reply(primary: bool, secondary: bool) -> HelloReply {
        serde_json::from_value(serde_json::json!({
            "isWritablePrimary": primary,
            "secondary": secondary,
        }))
        .unwrap()
    }

    #[test]
    fn connection_string_uses_advertised_hosts() {
        assert_eq!(
            set(false).connection_string(),
            "rs0/127.0.0.1:20000,127.0.0.1:20001,127.0.0.1:20002"
        );
        assert_eq!(
            set(true).connection_string(),
            "rs0/127.0.0.1:21000,127.0.0.1:21001,127.0.0.1:21002"
        );
    }

    #[test]
    fn removed_members_are_hidden() {
        let mut s = set(false);
        s.members[1].removed = true;
        assert_eq!(s.members().map(|m| m.id).collect::<Vec<_>>(), vec![0, 2]);
        assert!(matches!(s.member(1), Err(HarnessError::MemberNotFound { id: 1, .. })));
        assert_eq!(s.all_slots().len(), 3);
    }

    #[test]
    fn arbiter_lookup_follows_topology() {
        let s = set(false);
        assert!(s.is_arbiter(2));
        assert!(!s.is_arbiter(0));
    }

    #[test]
    fn torn_down_sets_stay_torn_down() {
        let mut s = set(false);
        s.state = SetState::TornDown;
        s.mark_degraded();
        assert_eq!(s.state(), SetState::TornDown);
        assert!(matches!(s.ensure_live(), Err(HarnessError::TornDown { .. })));
    }

    #[test]
    fn sole_primary_requires_exactly_one() {
        let unreachable = AdminError::Unreachable {
            addr: HostAddr::localhost(20002),
            message: "connection refused".into(),
        };
        let views = vec![
            view(0, Ok(reply(true, false))),
            view(1, Ok(reply(false, true))),
            view(2, Err(unreachable)),
        ];
        assert_eq!(sole_primary(&views), Ok(0));
        assert_eq!(describe(&views), "rs0-0=PRIMARY, rs0-1=SECONDARY, rs0-2=unreachable");

        let two = vec![view(0, Ok(reply(true, false))), view(1, Ok(reply(true, false)))];
        assert!(sole_primary(&two).unwrap_err().starts_with("multiple primaries"));
        assert!(sole_primary(&views[1..]).unwrap_err().starts_with("no primary"));
    }
}
