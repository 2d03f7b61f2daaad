use fleet_config::{Check, ConfigError, MemberSpec, TopologyConfig, WaitError, env, wait_until};

use super::{MemberSlot, ReconfigOptions, ReplicaSetController, ReplicaSetHandle, sole_primary};
use crate::admin::{Admin, AdminError};
use crate::admin::protocol::{AdminCommand, ReplSetConfig};
use crate::error::{HarnessError, Result};
use crate::process::{ProcessHandle, ProcessManager, StopSignal};

impl ReplicaSetController {
    /// Install `topology` as the set's new member list.
    pub async fn reconfig(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        topology: &TopologyConfig,
    ) -> Result<()> {
        self.reconfig_with(procs, set, topology, ReconfigOptions::default()).await
    }

    /// Install `topology` as the set's new member list.
    ///
    /// Members with new ids get fresh processes before the reconfig is sent;
    /// members that disappear are stopped once the live set has accepted it.
    /// The config version is the live version plus one.
    pub async fn reconfig_with(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        topology: &TopologyConfig,
        opts: ReconfigOptions,
    ) -> Result<()> {
        set.ensure_live()?;
        topology.validate()?;
        if topology.name != set.name() {
            return Err(ConfigError::InvalidTopology {
                path: topology.name.clone(),
                message: format!("cannot rename replica set {}", set.name()),
            }
            .into());
        }

        // Ids coming back after a removal get a clean slate.
        let returning: Vec<MemberSlot> = set
            .members
            .iter()
            .filter(|s| s.removed && topology.member_by_id(s.id).is_some())
            .cloned()
            .collect();
        for slot in &returning {
            forget_slot(procs, slot).await?;
        }
        set.members.retain(|s| !(s.removed && topology.member_by_id(s.id).is_some()));

        let mut started = Vec::new();
        for member in topology.members.iter().filter(|m| set.member(m.id).is_err()) {
            match self.start_member(procs, topology, member).await {
                Ok(slot) => started.push(slot),
                Err(e) => {
                    rollback(procs, &started).await;
                    return Err(e);
                }
            }
        }

        let hosts: Vec<_> = topology
            .members
            .iter()
            .filter_map(|m| {
                set.members()
                    .chain(&started)
                    .find(|s| s.id == m.id)
                    .map(|s| s.advertised().clone())
            })
            .collect();
        let desired = ReplSetConfig::from_topology(topology, &hosts);

        let installed = match self.send_reconfig(set, desired, opts).await {
            Ok(config) => config,
            Err(e) => {
                rollback(procs, &started).await;
                return Err(e);
            }
        };
        tracing::info!(
            set = %set.name(),
            version = installed.version,
            members = installed.members.len(),
            force = opts.force,
            "reconfig accepted"
        );

        set.members.extend(started);
        set.current = topology.clone();
        set.config = installed;
        for slot in set.members.iter_mut().filter(|s| !s.removed) {
            if topology.member_by_id(slot.id).is_some() {
                continue;
            }
            for handle in std::iter::once(&slot.server).chain(&slot.bridge) {
                procs.stop(handle, StopSignal::Graceful).await?;
            }
            slot.removed = true;
            if set.primary == Some(slot.id) {
                set.primary = None;
            }
        }

        self.await_config_replication(procs, set, env::default_timeout()).await
    }

    /// Send `replSetReconfig`, retrying transient errors. The version is
    /// computed from the live config on every attempt.
    async fn send_reconfig(
        &self,
        set: &ReplicaSetHandle,
        desired: ReplSetConfig,
        opts: ReconfigOptions,
    ) -> Result<ReplSetConfig> {
        let (admin, desired) = (&self.admin, &desired);
        let what = format!("replSetReconfig of {}", set.name());
        let outcome = wait_until(what, env::default_timeout(), move || async move {
            let target = if opts.force {
                let Some(slot) = first_reachable(admin, set).await else {
                    return Ok(Check::pending("no member reachable"));
                };
                slot
            } else {
                let views = self.survey(set).await;
                match sole_primary(&views) {
                    Ok(id) => match set.members().find(|m| m.id == id) {
                        Some(slot) => slot,
                        None => return Ok(Check::pending(format!("member {id} not in set"))),
                    },
                    Err(observed) => return Ok(Check::Pending(observed)),
                }
            };

            let live = admin.repl_config(target.server.addr()).await?;
            if live.id == desired.id && live.members == desired.members {
                // Already installed, possibly by an attempt whose reply was lost.
                return Ok(Check::Ready(live));
            }
            let mut next = desired.clone();
            next.version = live.version + 1;
            next.term = live.term;
            next.configsvr = live.configsvr;
            let cmd = AdminCommand::ReplSetReconfig { config: next.clone(), force: opts.force };
            admin.run(target.server.addr(), &cmd).await?;
            Ok(Check::Ready(next))
        })
        .fail_fast(|e: &AdminError| !e.is_transient())
        .await;

        outcome.map_err(|e| match e {
            WaitError::Aborted(e) => {
                HarnessError::ReconfigRejected { set: set.name().to_owned(), reason: e.to_string() }
            }
            WaitError::Timeout(t) => t.into(),
        })
    }

    /// Add one member through a reconfig and return its server.
    pub async fn add_member(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        member: MemberSpec,
    ) -> Result<ProcessHandle> {
        let id = member.id;
        let topology = set.topology().with_member(member);
        self.reconfig(procs, set, &topology).await?;
        Ok(set.member(id)?.server.clone())
    }

    /// Remove member `id` through a reconfig; its processes are stopped.
    pub async fn remove_member(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        id: u32,
    ) -> Result<()> {
        set.member(id)?;
        let topology = set.topology().without_member(id);
        self.reconfig(procs, set, &topology).await
    }
}

async fn first_reachable<'a>(admin: &Admin, set: &'a ReplicaSetHandle) -> Option<&'a MemberSlot> {
    for slot in set.members() {
        if admin.ping(slot.server.addr()).await.is_ok() {
            return Some(slot);
        }
    }
    None
}

async fn forget_slot(procs: &mut ProcessManager, slot: &MemberSlot) -> Result<()> {
    for handle in std::iter::once(&slot.server).chain(&slot.bridge) {
        procs.remove(handle, false).await?;
    }
    Ok(())
}

async fn rollback(procs: &mut ProcessManager, started: &[MemberSlot]) {
    for slot in started {
        if let Err(e) = forget_slot(procs, slot).await {
            tracing::warn!(name = %slot.name(), error = %e, "rollback of new member failed");
        }
    }
}
