use std::time::Duration;

use fleet_config::{Check, WaitError, env, wait_until};

use super::{ReplicaSetController, ReplicaSetHandle, sole_primary};
use crate::admin::AdminError;
use crate::admin::protocol::{AdminCommand, OpTime, OplogNoteReply, ReplSetConfig, ReplStatus};
use crate::error::{HarnessError, Result};
use crate::process::ProcessManager;

impl ReplicaSetController {
    /// Wait until every running, non-arbiter secondary has applied up to the
    /// primary's last optime.
    ///
    /// Each poll reads the primary's optime first and compares every
    /// secondary against that same value, so writes that land mid-wait only
    /// move the target forward.
    pub async fn await_replication(
        &self,
        procs: &ProcessManager,
        set: &ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<()> {
        set.ensure_live()?;
        let admin = &self.admin;
        let what = format!("replication in {}", set.name());
        let outcome = wait_until(what, timeout, move || async move {
            let views = self.survey(set).await;
            let primary_id = match sole_primary(&views) {
                Ok(id) => id,
                Err(observed) => return Ok::<_, AdminError>(Check::Pending(observed)),
            };
            let Some(primary) = set.members().find(|m| m.id == primary_id) else {
                return Ok(Check::pending(format!("member {primary_id} is not in the set")));
            };
            let Some(target) = last_applied(&admin.repl_status(primary.server.addr()).await?)
            else {
                return Ok(Check::pending(format!("{} reported no optime", primary.name())));
            };

            let mut behind = Vec::new();
            for slot in set.members() {
                if slot.id == primary_id
                    || set.is_arbiter(slot.id)
                    || !procs.is_running(&slot.server)
                {
                    continue;
                }
                match admin.repl_status(slot.server.addr()).await {
                    Ok(status) => match last_applied(&status) {
                        Some(op) if op >= target => {}
                        Some(op) => behind.push(format!("{} at {op}", slot.name())),
                        None => behind.push(format!("{} has no optime", slot.name())),
                    },
                    Err(e) => behind.push(format!("{}: {e}", slot.name())),
                }
            }
            if behind.is_empty() {
                return Ok(Check::Ready(()));
            }
            Ok(Check::pending(format!(
                "primary {} at {target}; behind: {}",
                primary.name(),
                behind.join(", ")
            )))
        })
        .await;

        outcome.map_err(|e| match e {
            WaitError::Timeout(t) => HarnessError::ReplicationLagTimeout {
                set: set.name().to_owned(),
                waited: t.elapsed,
                snapshot: t.last_observed.unwrap_or_default(),
            },
            WaitError::Aborted(e) => e.into(),
        })
    }

    /// Wait until every running member reports the primary's config version.
    pub async fn await_config_replication(
        &self,
        procs: &ProcessManager,
        set: &mut ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<()> {
        set.ensure_live()?;
        let view: &ReplicaSetHandle = set;
        let admin = &self.admin;
        let what = format!("config of {} to replicate", view.name());
        let config = wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            let primary_id = match sole_primary(&views) {
                Ok(id) => id,
                Err(observed) => return Ok::<_, AdminError>(Check::Pending(observed)),
            };
            let Some(primary) = view.members().find(|m| m.id == primary_id) else {
                return Ok(Check::pending(format!("member {primary_id} is not in the set")));
            };
            let config = admin.repl_config(primary.server.addr()).await?;

            let mut stale = Vec::new();
            for slot in view.members().filter(|m| m.id != primary_id) {
                if !procs.is_running(&slot.server) {
                    continue;
                }
                match admin.repl_config(slot.server.addr()).await {
                    Ok(c) if (c.term, c.version) == (config.term, config.version) => {}
                    Ok(c) => stale.push(format!("{} has v{} t{}", slot.name(), c.version, c.term)),
                    Err(e) => stale.push(format!("{}: {e}", slot.name())),
                }
            }
            Ok(if stale.is_empty() {
                Check::Ready(config)
            } else {
                Check::pending(format!(
                    "primary has v{} t{}; {}",
                    config.version,
                    config.term,
                    stale.join(", ")
                ))
            })
        })
        .await?;
        set.config = config;
        Ok(())
    }

    /// Write a no-op note on the primary and return its optime. Useful for
    /// advancing optimes before [`await_replication`](Self::await_replication).
    pub async fn append_note(&self, set: &mut ReplicaSetHandle, note: &str) -> Result<OpTime> {
        let id = self.primary_id(set, env::default_timeout()).await?;
        let addr = set.member(id)?.server.addr();
        let cmd = AdminCommand::AppendOplogNote { note: note.to_owned() };
        let reply: OplogNoteReply = self.admin.run_as(addr, &cmd).await?;
        Ok(reply.optime)
    }

    /// `replSetGetStatus` from the last known primary, or the first member
    /// that answers.
    pub async fn status(&self, set: &ReplicaSetHandle) -> Result<ReplStatus> {
        set.ensure_live()?;
        let candidates = set.last_known_primary().into_iter().chain(set.members());
        let mut last_err = None;
        for slot in candidates {
            match self.admin.repl_status(slot.server.addr()).await {
                Ok(status) => return Ok(status),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => HarnessError::MemberNotFound { set: set.name().to_owned(), id: 0 },
        })
    }

    /// The config as the current primary reports it.
    pub async fn live_config(&self, set: &mut ReplicaSetHandle) -> Result<ReplSetConfig> {
        let id = self.primary_id(set, env::default_timeout()).await?;
        Ok(self.admin.repl_config(set.member(id)?.server.addr()).await?)
    }
}

fn last_applied(status: &ReplStatus) -> Option<OpTime> {
    status.me().and_then(|m| m.optime)
}
