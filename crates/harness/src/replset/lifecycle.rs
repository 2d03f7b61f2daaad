use std::time::Duration;

use fleet_config::{Check, MemberSpec, TopologyConfig, WaitError, env, node_name, wait_until};

use super::{MemberSlot, ReplicaSetController, ReplicaSetHandle, SetState, describe, sole_primary};
use crate::admin::AdminError;
use crate::admin::protocol::{AdminCommand, ReplSetConfig, codes};
use crate::error::{HarnessError, Result};
use crate::process::{ProcessHandle, ProcessManager, RestartOptions, StartRequest, StopSignal};

impl ReplicaSetController {
    /// Start every member, initiate the set, and wait for it to elect a
    /// primary with everyone else secondary or arbiter.
    pub async fn initiate(
        &self,
        procs: &mut ProcessManager,
        topology: &TopologyConfig,
    ) -> Result<ReplicaSetHandle> {
        topology.validate()?;
        tracing::info!(
            set = %topology.name,
            members = topology.members.len(),
            "initiating replica set"
        );

        // Launch everything first, then wait, so members boot concurrently.
        let mut members = Vec::with_capacity(topology.members.len());
        for member in &topology.members {
            let req = server_request(procs, topology, member).no_wait();
            let server = procs.start(req).await?;
            members.push(MemberSlot { id: member.id, server, bridge: None, removed: false });
        }
        for slot in &members {
            procs.await_ready(&slot.server).await?;
        }
        if topology.use_bridge {
            for slot in &mut members {
                slot.bridge = Some(start_bridge(procs, &slot.server).await?);
            }
        }

        let hosts: Vec<_> = members.iter().map(|m| m.advertised().clone()).collect();
        let config = ReplSetConfig::from_topology(topology, &hosts);
        let mut set = ReplicaSetHandle {
            spec: topology.clone(),
            current: topology.clone(),
            config: config.clone(),
            members,
            primary: None,
            state: SetState::Initializing,
        };

        let seed = set.members[0].server.addr().clone();
        let cmd = AdminCommand::ReplSetInitiate { config };
        let (admin, seed_ref, cmd) = (&self.admin, &seed, &cmd);
        let what = format!("replSetInitiate on {seed}");
        let initiated = wait_until(what, env::default_timeout(), move || async move {
            match admin.run(seed_ref, cmd).await {
                Ok(_) => Ok(Check::Ready(())),
                Err(e) if e.code() == Some(codes::ALREADY_INITIALIZED) => Ok(Check::Ready(())),
                Err(e) => Err(e),
            }
        })
        .fail_fast(|e: &AdminError| !e.is_transient())
        .await;
        match initiated {
            Ok(()) => {}
            Err(WaitError::Aborted(e)) => return Err(e.into()),
            Err(WaitError::Timeout(t)) => {
                return Err(HarnessError::InitiateTimeout {
                    set: set.name().to_owned(),
                    waited: t.elapsed,
                    snapshot: t.last_observed.unwrap_or_default(),
                });
            }
        }

        let primary = self.await_initial_election(&set, env::default_timeout()).await?;
        set.remember_primary(primary);
        if let Some(slot) = set.last_known_primary()
            && let Ok(live) = self.admin.repl_config(slot.server.addr()).await
        {
            set.config = live;
        }
        set.state = SetState::Converged;
        tracing::info!(
            set = %set.name(),
            primary = %node_name(set.name(), primary),
            "replica set initiated"
        );
        Ok(set)
    }

    async fn await_initial_election(
        &self,
        set: &ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<u32> {
        let what = format!("{} to elect a primary", set.name());
        let outcome = wait_until(what, timeout, move || async move {
            let views = self.survey(set).await;
            let primary = match sole_primary(&views) {
                Ok(id) => id,
                Err(observed) => return Ok::<_, AdminError>(Check::Pending(observed)),
            };
            let settled =
                views.iter().all(|v| v.id == primary || v.is_secondary() || v.is_arbiter());
            Ok(if settled { Check::Ready(primary) } else { Check::Pending(describe(&views)) })
        })
        .await;
        outcome.map_err(|e| match e {
            WaitError::Timeout(t) => HarnessError::InitiateTimeout {
                set: set.name().to_owned(),
                waited: t.elapsed,
                snapshot: t.last_observed.unwrap_or_default(),
            },
            WaitError::Aborted(e) => e.into(),
        })
    }

    /// Wait until the set is healthy again after faults: one primary, every
    /// other running member secondary or arbiter, and the config agreed on.
    pub async fn await_converged(
        &self,
        procs: &ProcessManager,
        set: &mut ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<()> {
        set.ensure_live()?;
        let view: &ReplicaSetHandle = set;
        let what = format!("{} to converge", view.name());
        let primary = wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            let primary = match sole_primary(&views) {
                Ok(id) => id,
                Err(observed) => return Ok::<_, AdminError>(Check::Pending(observed)),
            };
            let settled = view.members().zip(&views).all(|(slot, v)| {
                v.id == primary
                    || v.is_secondary()
                    || v.is_arbiter()
                    || !procs.is_running(&slot.server)
            });
            Ok(if settled { Check::Ready(primary) } else { Check::Pending(describe(&views)) })
        })
        .await?;
        set.remember_primary(primary);
        self.await_config_replication(procs, set, timeout).await?;
        set.state = SetState::Converged;
        tracing::info!(set = %set.name(), "replica set converged");
        Ok(())
    }

    /// Stop every member and bridge. The set cannot be used afterwards.
    pub async fn stop_set(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
    ) -> Result<()> {
        if set.state == SetState::TornDown {
            return Ok(());
        }
        tracing::info!(set = %set.name(), "stopping replica set");
        let mut first_err = None;
        for slot in &set.members {
            for handle in std::iter::once(&slot.server).chain(&slot.bridge) {
                if let Err(e) = procs.stop(handle, StopSignal::Graceful).await {
                    tracing::warn!(name = %handle.name(), error = %e, "stop failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        set.state = SetState::TornDown;
        set.primary = None;
        first_err.map_or(Ok(()), Err)
    }

    /// Stop one member's server. The set counts as degraded until
    /// [`await_converged`](Self::await_converged) says otherwise.
    pub async fn stop_member(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        id: u32,
        signal: StopSignal,
    ) -> Result<ProcessHandle> {
        set.ensure_live()?;
        let server = set.member(id)?.server.clone();
        procs.stop(&server, signal).await?;
        set.mark_degraded();
        if set.last_known_primary().is_some_and(|p| p.id == id) {
            set.primary = None;
        }
        Ok(server)
    }

    /// Stop whichever member is primary right now.
    pub async fn stop_primary(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        signal: StopSignal,
    ) -> Result<ProcessHandle> {
        let id = self.primary_id(set, env::default_timeout()).await?;
        self.stop_member(procs, set, id, signal).await
    }

    /// Restart one member's server on its old port and wait until it answers.
    pub async fn restart_member(
        &self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        id: u32,
        opts: RestartOptions,
    ) -> Result<ProcessHandle> {
        set.ensure_live()?;
        let server = set.member(id)?.server.clone();
        procs.restart(&server, opts).await?;
        Ok(server)
    }

    /// Start the processes for a member joining through a reconfig.
    pub(super) async fn start_member(
        &self,
        procs: &mut ProcessManager,
        topology: &TopologyConfig,
        member: &MemberSpec,
    ) -> Result<MemberSlot> {
        let req = server_request(procs, topology, member);
        let server = procs.start(req).await?;
        let bridge =
            if topology.use_bridge { Some(start_bridge(procs, &server).await?) } else { None };
        Ok(MemberSlot { id: member.id, server, bridge, removed: false })
    }
}

fn server_request(
    procs: &ProcessManager,
    topology: &TopologyConfig,
    member: &MemberSpec,
) -> StartRequest {
    let mut options = topology.launch_options(member);
    if !options.contains("replSet") {
        options.insert("replSet", &topology.name);
    }
    StartRequest::server(node_name(&topology.name, member.id))
        .dbpath(procs.settings().data_dir.node_dir(&topology.name, member.id))
        .options(&options)
        .clean_data(true)
}

async fn start_bridge(procs: &mut ProcessManager, server: &ProcessHandle) -> Result<ProcessHandle> {
    procs.start(StartRequest::bridge(format!("{}-bridge", server.name()), server.addr())).await
}
