use std::time::Duration;

use fleet_config::{Check, WaitError, env, wait_until};

use super::{ReplicaSetController, ReplicaSetHandle, describe, sole_primary};
use crate::admin::AdminError;
use crate::admin::protocol::{AdminCommand, MemberState};
use crate::error::{HarnessError, Result};
use crate::process::{ProcessHandle, ProcessManager};

impl ReplicaSetController {
    /// Wait for exactly one member to report itself writable primary.
    pub async fn get_primary(
        &self,
        set: &mut ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<ProcessHandle> {
        let id = self.primary_id(set, timeout).await?;
        Ok(set.member(id)?.server.clone())
    }

    pub(super) async fn primary_id(
        &self,
        set: &mut ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<u32> {
        set.ensure_live()?;
        let view: &ReplicaSetHandle = set;
        let what = format!("a primary in {}", view.name());
        let id = wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            Ok::<_, AdminError>(match sole_primary(&views) {
                Ok(id) => Check::Ready(id),
                Err(observed) => Check::Pending(observed),
            })
        })
        .await?;
        set.remember_primary(id);
        Ok(id)
    }

    /// Step the current primary down and wait for a different member to take
    /// over. Returns the new primary.
    ///
    /// The old primary drops its connections while stepping down, so a
    /// network error from the command itself is expected. A primary refuses
    /// with `ExceededTimeLimit` while no electable secondary has caught up;
    /// the command is resent until one has or the default timeout passes.
    pub async fn step_down(
        &self,
        set: &mut ReplicaSetHandle,
        step_down_for: Duration,
    ) -> Result<ProcessHandle> {
        let old_id = match self.primary_id(set, env::default_timeout()).await {
            Err(HarnessError::WaitTimeoutExceeded(t)) => {
                return Err(HarnessError::NoNewPrimaryElected {
                    set: set.name().to_owned(),
                    old_primary: set
                        .last_known_primary()
                        .map_or_else(|| "none".to_owned(), |m| m.name().to_owned()),
                    snapshot: t.last_observed.unwrap_or_default(),
                });
            }
            other => other?,
        };
        let old = set.member(old_id)?.server.clone();
        tracing::info!(
            set = %set.name(),
            primary = %old.name(),
            ?step_down_for,
            "stepping down primary"
        );

        let has_candidate =
            set.config().members.iter().any(|m| m.id != old_id && m.is_electable());
        let cmd =
            AdminCommand::ReplSetStepDown { secs: step_down_for.as_secs().max(1), force: false };
        let (admin, addr, cmd) = (&self.admin, old.addr(), &cmd);
        let what = format!("{} to step down", old.name());
        let sent = wait_until(what, env::default_timeout(), move || async move {
            match admin.run(addr, cmd).await {
                Ok(_) => Ok(Check::Ready(())),
                Err(e) if e.is_network() => {
                    tracing::debug!(error = %e, "connection dropped by stepdown, as expected");
                    Ok(Check::Ready(()))
                }
                Err(e) if has_candidate && e.code_name() == Some("ExceededTimeLimit") => {
                    Ok(Check::Pending(e.to_string()))
                }
                Err(e) => Err(e),
            }
        })
        .fail_fast(|_: &AdminError| true)
        .await;
        match sent {
            Ok(()) => {}
            Err(WaitError::Timeout(t)) => {
                return Err(HarnessError::NoNewPrimaryElected {
                    set: set.name().to_owned(),
                    old_primary: old.name().to_owned(),
                    snapshot: t.last_observed.unwrap_or_default(),
                });
            }
            Err(WaitError::Aborted(e)) => return Err(e.into()),
        }

        self.await_new_primary(set, &old, env::default_timeout()).await
    }

    /// Wait for a sole primary other than `old`, e.g. after `old` was
    /// stepped down or killed. Fails with `NoNewPrimaryElected`.
    pub async fn await_new_primary(
        &self,
        set: &mut ReplicaSetHandle,
        old: &ProcessHandle,
        timeout: Duration,
    ) -> Result<ProcessHandle> {
        set.ensure_live()?;
        let old_id = set.member_by_name(old.name()).map(|m| m.id);
        let view: &ReplicaSetHandle = set;
        let what = format!("a new primary in {} after {}", view.name(), old.name());
        let outcome = wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            Ok::<_, AdminError>(match sole_primary(&views) {
                Ok(id) if Some(id) != old_id => Check::Ready(id),
                Ok(_) => Check::pending(format!("{} is still primary", old.name())),
                Err(observed) => Check::Pending(observed),
            })
        })
        .await;

        match outcome {
            Ok(new_id) => {
                set.remember_primary(new_id);
                let new = set.member(new_id)?.server.clone();
                tracing::info!(set = %set.name(), primary = %new.name(), "new primary elected");
                Ok(new)
            }
            Err(WaitError::Timeout(t)) => Err(HarnessError::NoNewPrimaryElected {
                set: set.name().to_owned(),
                old_primary: old.name().to_owned(),
                snapshot: t.last_observed.unwrap_or_default(),
            }),
            Err(WaitError::Aborted(e)) => Err(e.into()),
        }
    }

    /// Ask member `id` to run for election and wait until it wins.
    pub async fn step_up(&self, set: &mut ReplicaSetHandle, id: u32) -> Result<ProcessHandle> {
        set.ensure_live()?;
        let server = set.member(id)?.server.clone();
        let (admin, addr) = (&self.admin, server.addr());
        let what = format!("{} to step up", server.name());
        wait_until(what, env::default_timeout(), move || async move {
            let hello = admin.hello(addr).await?;
            if hello.is_writable_primary {
                return Ok(Check::Ready(()));
            }
            match admin.run(addr, &AdminCommand::ReplSetStepUp).await {
                Ok(_) => Ok(Check::pending("stepUp accepted, not primary yet")),
                Err(e) if e.is_transient() => Ok(Check::Pending(e.to_string())),
                Err(e) => Err(e),
            }
        })
        .fail_fast(|e: &AdminError| !e.is_transient())
        .await?;
        set.remember_primary(id);
        tracing::info!(set = %set.name(), primary = %server.name(), "member stepped up");
        Ok(server)
    }

    /// Keep member `id` from running for election for `duration`.
    pub async fn freeze(&self, set: &ReplicaSetHandle, id: u32, duration: Duration) -> Result<()> {
        set.ensure_live()?;
        let addr = set.member(id)?.server.addr();
        self.admin.run(addr, &AdminCommand::ReplSetFreeze { secs: duration.as_secs() }).await?;
        Ok(())
    }

    pub async fn unfreeze(&self, set: &ReplicaSetHandle, id: u32) -> Result<()> {
        self.freeze(set, id, Duration::ZERO).await
    }

    /// Wait until no member reports itself primary.
    pub async fn await_no_primary(
        &self,
        set: &mut ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<()> {
        set.ensure_live()?;
        let view: &ReplicaSetHandle = set;
        let what = format!("{} to have no primary", view.name());
        wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            let ready = !views.iter().any(|v| v.is_primary());
            Ok::<_, AdminError>(if ready {
                Check::Ready(())
            } else {
                Check::Pending(describe(&views))
            })
        })
        .await?;
        set.primary = None;
        Ok(())
    }

    /// Wait until every reachable member names the same primary, and that
    /// primary is `expected` when given.
    pub async fn await_nodes_agree_on_primary(
        &self,
        set: &mut ReplicaSetHandle,
        expected: Option<u32>,
        timeout: Duration,
    ) -> Result<ProcessHandle> {
        set.ensure_live()?;
        let expected_host = match expected {
            Some(id) => Some(set.member(id)?.advertised().clone()),
            None => None,
        };
        let view: &ReplicaSetHandle = set;
        let expected_host = expected_host.as_ref();
        let what = format!("members of {} to agree on a primary", view.name());
        let agreed = wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            let answered: Vec<_> = views.iter().filter(|v| v.hello.is_ok()).collect();
            let Some(first) = answered.first().and_then(|v| v.primary()) else {
                return Ok::<_, AdminError>(Check::Pending(describe(&views)));
            };
            let agree = answered.iter().all(|v| v.primary() == Some(first));
            let matches = expected_host.is_none_or(|want| want == first);
            if !agree || !matches {
                return Ok(Check::Pending(describe_primaries(&views)));
            }
            Ok(view.members().find(|m| m.advertised() == first).map_or_else(
                || Check::pending(format!("{first} is not a member")),
                |m| Check::Ready(m.id),
            ))
        })
        .await?;
        set.remember_primary(agreed);
        Ok(set.member(agreed)?.server.clone())
    }

    /// Wait until the primary is one of the highest-priority electable members.
    pub async fn await_highest_priority_primary(
        &self,
        set: &mut ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<ProcessHandle> {
        set.ensure_live()?;
        let top = set.topology().highest_priority_members();
        let (view, top) = (&*set, &top);
        let what = format!("a highest-priority primary in {}", view.name());
        let id = wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            Ok::<_, AdminError>(match sole_primary(&views) {
                Ok(id) if top.contains(&id) => Check::Ready(id),
                Ok(id) => Check::pending(format!("member {id} is primary, want one of {top:?}")),
                Err(observed) => Check::Pending(observed),
            })
        })
        .await?;
        set.remember_primary(id);
        Ok(set.member(id)?.server.clone())
    }

    /// Wait until member `id` reports one of `states` for itself.
    pub async fn wait_for_state(
        &self,
        set: &ReplicaSetHandle,
        id: u32,
        states: &[MemberState],
        timeout: Duration,
    ) -> Result<MemberState> {
        set.ensure_live()?;
        let slot = set.member(id)?;
        let (admin, addr) = (&self.admin, slot.server.addr());
        let what = format!("{} to reach {states:?}", slot.name());
        let state = wait_until(what, timeout, move || async move {
            let state = admin.repl_status(addr).await?.my_state;
            Ok::<_, AdminError>(if states.contains(&state) {
                Check::Ready(state)
            } else {
                Check::pending(format!("state {state}"))
            })
        })
        .await?;
        Ok(state)
    }

    /// Wait until every running member other than the primary is a
    /// secondary, or an arbiter if it was configured as one.
    pub async fn await_secondaries(
        &self,
        procs: &ProcessManager,
        set: &mut ReplicaSetHandle,
        timeout: Duration,
    ) -> Result<()> {
        set.ensure_live()?;
        let view: &ReplicaSetHandle = set;
        let what = format!("secondaries of {}", view.name());
        wait_until(what, timeout, move || async move {
            let views = self.survey(view).await;
            let ready = view.members().zip(&views).all(|(slot, v)| {
                !procs.is_running(&slot.server)
                    || v.is_primary()
                    || if view.is_arbiter(slot.id) { v.is_arbiter() } else { v.is_secondary() }
            });
            Ok::<_, AdminError>(if ready {
                Check::Ready(())
            } else {
                Check::Pending(describe(&views))
            })
        })
        .await?;
        Ok(())
    }
}

fn describe_primaries(views: &[super::MemberView]) -> String {
    views
        .iter()
        .map(|v| match v.primary() {
            Some(p) => format!("{} sees {p}", v.name),
            None => format!("{} sees no primary", v.name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
