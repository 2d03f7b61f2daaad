//! Fault injection: kills, partitions and delays, with auto-heal.
//!
//! Network faults are bridge rules. Traffic from `b` to `a` goes through
//! `a`'s bridge, so a partition installs a reject rule for `b`'s advertised
//! host on `a`'s bridge and the mirror rule on `b`'s.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use fleet_config::HostAddr;
use tokio::time::Instant;

use crate::admin::protocol::AdminCommand;
use crate::error::{HarnessError, Result};
use crate::process::{ProcessHandle, ProcessManager, RestartOptions, StopSignal};
use crate::replset::{MemberSlot, ReplicaSetController, ReplicaSetHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FaultId(pub u64);

impl fmt::Display for FaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Partition,
    Kill,
    Delay(Duration),
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Partition => f.write_str("partition"),
            FaultKind::Kill => f.write_str("kill"),
            FaultKind::Delay(d) => write!(f, "delay {d:?}"),
        }
    }
}

/// One bridge rule: `bridge` treats traffic from `from` specially.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    bridge: HostAddr,
    from: HostAddr,
}

#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub id: FaultId,
    pub kind: FaultKind,
    /// Servers the fault applies to.
    pub targets: Vec<ProcessHandle>,
    pub started_at: Instant,
    pub heal_at: Option<Instant>,
    rules: Vec<Rule>,
}

impl FaultRecord {
    fn is_network(&self) -> bool {
        !matches!(self.kind, FaultKind::Kill)
    }

    fn same_pair(&self, a: &ProcessHandle, b: &ProcessHandle) -> bool {
        matches!(self.targets.as_slice(), [x, y] if (x == a && y == b) || (x == b && y == a))
    }

    fn touches(&self, handle: &ProcessHandle) -> bool {
        self.targets.contains(handle)
    }
}

/// Injects faults and remembers them until they are healed.
///
/// Every operation first heals records whose `heal_at` has passed.
pub struct FaultInjector {
    replsets: ReplicaSetController,
    records: BTreeMap<FaultId, FaultRecord>,
    next_id: u64,
}

impl FaultInjector {
    pub fn new(replsets: ReplicaSetController) -> Self {
        Self { replsets, records: BTreeMap::new(), next_id: 1 }
    }

    /// Outstanding faults, oldest first.
    pub fn active(&self) -> impl Iterator<Item = &FaultRecord> {
        self.records.values()
    }

    pub fn get(&self, id: FaultId) -> Option<&FaultRecord> {
        self.records.get(&id)
    }

    /// Stop `handle` with `signal` and record a kill.
    pub async fn kill_node(
        &mut self,
        procs: &mut ProcessManager,
        handle: &ProcessHandle,
        signal: StopSignal,
    ) -> Result<FaultId> {
        self.heal_expired().await?;
        procs.stop(handle, signal).await?;
        Ok(self.record(FaultKind::Kill, vec![handle.clone()], Vec::new(), None))
    }

    /// Kill `handle` and bring it back on the same port with its data.
    /// Says nothing about whether it rejoins anything.
    pub async fn restart_after_crash(
        &mut self,
        procs: &mut ProcessManager,
        handle: &ProcessHandle,
    ) -> Result<()> {
        self.kill_node(procs, handle, StopSignal::Kill).await?;
        procs.restart(handle, RestartOptions::default()).await?;
        self.forget_kills(handle);
        Ok(())
    }

    /// Block traffic both ways between two bridged members.
    pub async fn partition(&mut self, a: &MemberSlot, b: &MemberSlot) -> Result<FaultId> {
        self.install_partition(a, b, None).await
    }

    /// Like [`partition`](Self::partition), healed by the first injector call
    /// after `heal_after` has passed.
    pub async fn partition_for(
        &mut self,
        a: &MemberSlot,
        b: &MemberSlot,
        heal_after: Duration,
    ) -> Result<FaultId> {
        self.install_partition(a, b, Some(heal_after)).await
    }

    async fn install_partition(
        &mut self,
        a: &MemberSlot,
        b: &MemberSlot,
        heal_after: Option<Duration>,
    ) -> Result<FaultId> {
        self.heal_expired().await?;
        if let Some(existing) = self.find_pair(FaultKind::Partition, &a.server, &b.server) {
            return Ok(existing);
        }
        let rules = pair_rules(a, b)?;
        self.install_rules(
            &rules,
            |r| AdminCommand::RejectConnectionsFrom { host: r.from.clone() },
            |r| AdminCommand::AcceptConnectionsFrom { host: r.from.clone() },
        )
        .await?;
        let targets = vec![a.server.clone(), b.server.clone()];
        Ok(self.record(FaultKind::Partition, targets, rules, heal_after))
    }

    /// Lift the partition between `a` and `b`. Returns `false` when there was
    /// none.
    pub async fn heal_partition(&mut self, a: &MemberSlot, b: &MemberSlot) -> Result<bool> {
        self.heal_expired().await?;
        match self.find_pair(FaultKind::Partition, &a.server, &b.server) {
            Some(id) => {
                self.heal(id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delay traffic both ways between two bridged members.
    pub async fn delay(
        &mut self,
        a: &MemberSlot,
        b: &MemberSlot,
        delay: Duration,
        heal_after: Option<Duration>,
    ) -> Result<FaultId> {
        self.heal_expired().await?;
        let rules = pair_rules(a, b)?;
        // A new delay on the same pair replaces the old rule. If the new one
        // cannot be installed, the old delay goes back on.
        let replaced: Vec<(FaultId, Duration)> = self
            .records
            .values()
            .filter(|r| r.same_pair(&a.server, &b.server))
            .filter_map(|r| match r.kind {
                FaultKind::Delay(d) => Some((r.id, d)),
                _ => None,
            })
            .collect();
        let previous = replaced.last().map_or(Duration::ZERO, |(_, d)| *d);
        let set_delay = |d: Duration| {
            move |r: &Rule| AdminCommand::DelayMessagesFrom {
                host: r.from.clone(),
                delay_ms: millis(d),
            }
        };
        self.install_rules(&rules, set_delay(delay), set_delay(previous)).await?;
        for (id, _) in replaced {
            self.records.remove(&id);
        }
        let targets = vec![a.server.clone(), b.server.clone()];
        Ok(self.record(FaultKind::Delay(delay), targets, rules, heal_after))
    }

    /// Heal every record whose auto-heal time has passed.
    pub async fn heal_expired(&mut self) -> Result<Vec<FaultId>> {
        let now = Instant::now();
        let due: Vec<FaultId> = self
            .records
            .values()
            .filter(|r| r.heal_at.is_some_and(|at| at <= now))
            .map(|r| r.id)
            .collect();
        for id in &due {
            self.heal(*id).await?;
        }
        Ok(due)
    }

    /// Lift every network rule and forget every kill. A rule that cannot be
    /// lifted is logged and dropped; the first such error is returned.
    pub async fn heal_all(&mut self) -> Result<()> {
        let ids: Vec<FaultId> = self.records.keys().copied().collect();
        self.discard(ids).await
    }

    /// Like [`heal_all`](Self::heal_all), limited to faults that target one
    /// of `servers`. Faults on anything else stay in place.
    pub async fn release(&mut self, servers: &[ProcessHandle]) -> Result<()> {
        let ids: Vec<FaultId> = self
            .records
            .values()
            .filter(|r| servers.iter().any(|s| r.touches(s)))
            .map(|r| r.id)
            .collect();
        self.discard(ids).await
    }

    async fn discard(&mut self, ids: Vec<FaultId>) -> Result<()> {
        let mut first_err = None;
        for id in ids {
            let Some(record) = self.records.remove(&id) else {
                continue;
            };
            if !record.is_network() {
                continue;
            }
            if let Err(e) = self.lift(&record).await {
                tracing::warn!(fault = %id, error = %e, "could not heal fault");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Hard-kill member `id` of `set`.
    pub async fn kill_member(
        &mut self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
        id: u32,
    ) -> Result<ProcessHandle> {
        self.heal_expired().await?;
        let server = self.replsets.stop_member(procs, set, id, StopSignal::Kill).await?;
        self.record(FaultKind::Kill, vec![server.clone()], Vec::new(), None);
        Ok(server)
    }

    /// Hard-kill whichever member of `set` is primary.
    pub async fn kill_primary(
        &mut self,
        procs: &mut ProcessManager,
        set: &mut ReplicaSetHandle,
    ) -> Result<ProcessHandle> {
        self.heal_expired().await?;
        let server = self.replsets.stop_primary(procs, set, StopSignal::Kill).await?;
        self.record(FaultKind::Kill, vec![server.clone()], Vec::new(), None);
        Ok(server)
    }

    pub async fn partition_members(
        &mut self,
        set: &mut ReplicaSetHandle,
        a: u32,
        b: u32,
    ) -> Result<FaultId> {
        let (sa, sb) = (set.member(a)?.clone(), set.member(b)?.clone());
        let id = self.partition(&sa, &sb).await?;
        set.mark_degraded();
        Ok(id)
    }

    /// Partition member `id` from every other member of `set`.
    pub async fn isolate_member(
        &mut self,
        set: &mut ReplicaSetHandle,
        id: u32,
    ) -> Result<Vec<FaultId>> {
        let target = set.member(id)?.clone();
        let others: Vec<MemberSlot> = set.members().filter(|m| m.id != id).cloned().collect();
        let mut ids = Vec::with_capacity(others.len());
        for other in &others {
            ids.push(self.partition(&target, other).await?);
        }
        set.mark_degraded();
        tracing::info!(set = %set.name(), member = %target.name(), "member isolated");
        Ok(ids)
    }

    /// Heal every network fault touching a member of `set`. Returns how many
    /// were healed. The set stays degraded until a convergence wait passes.
    pub async fn heal_members(&mut self, set: &ReplicaSetHandle) -> Result<usize> {
        self.heal_expired().await?;
        let ids: Vec<FaultId> = self
            .records
            .values()
            .filter(|r| r.is_network() && set.members().any(|m| r.touches(&m.server)))
            .map(|r| r.id)
            .collect();
        for id in &ids {
            self.heal(*id).await?;
        }
        Ok(ids.len())
    }

    fn record(
        &mut self,
        kind: FaultKind,
        targets: Vec<ProcessHandle>,
        rules: Vec<Rule>,
        heal_after: Option<Duration>,
    ) -> FaultId {
        let id = FaultId(self.next_id);
        self.next_id += 1;
        let started_at = Instant::now();
        let names: Vec<&str> = targets.iter().map(|t| t.name()).collect();
        tracing::info!(fault = %id, %kind, targets = ?names, ?heal_after, "fault injected");
        let heal_at = heal_after.map(|d| started_at + d);
        self.records.insert(id, FaultRecord { id, kind, targets, started_at, heal_at, rules });
        id
    }

    async fn heal(&mut self, id: FaultId) -> Result<()> {
        let Some(record) = self.records.get(&id) else {
            return Ok(());
        };
        if record.is_network() {
            let record = record.clone();
            self.lift(&record).await?;
        }
        self.records.remove(&id);
        tracing::info!(fault = %id, "fault healed");
        Ok(())
    }

    /// Send `install` to each rule's bridge in order. When one fails, the
    /// bridges already changed get `undo` so no half-applied fault is left
    /// behind, and the original error is returned.
    async fn install_rules(
        &self,
        rules: &[Rule],
        install: impl Fn(&Rule) -> AdminCommand,
        undo: impl Fn(&Rule) -> AdminCommand,
    ) -> Result<()> {
        let admin = self.replsets.admin();
        for (i, rule) in rules.iter().enumerate() {
            let Err(e) = admin.run(&rule.bridge, &install(rule)).await else {
                continue;
            };
            for done in &rules[..i] {
                if let Err(undo_err) = admin.run(&done.bridge, &undo(done)).await {
                    tracing::warn!(
                        bridge = %done.bridge,
                        error = %undo_err,
                        "could not undo bridge rule"
                    );
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn lift(&self, record: &FaultRecord) -> Result<()> {
        for rule in &record.rules {
            let cmd = match record.kind {
                FaultKind::Delay(_) => {
                    AdminCommand::DelayMessagesFrom { host: rule.from.clone(), delay_ms: 0 }
                }
                _ => AdminCommand::AcceptConnectionsFrom { host: rule.from.clone() },
            };
            self.replsets.admin().run(&rule.bridge, &cmd).await?;
        }
        Ok(())
    }

    fn find_pair(&self, kind: FaultKind, a: &ProcessHandle, b: &ProcessHandle) -> Option<FaultId> {
        self.records.values().find(|r| r.kind == kind && r.same_pair(a, b)).map(|r| r.id)
    }

    fn forget_kills(&mut self, handle: &ProcessHandle) {
        self.records.retain(|_, r| !(r.kind == FaultKind::Kill && r.touches(handle)));
    }
}

/// Bridge delays travel as whole milliseconds.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn pair_rules(a: &MemberSlot, b: &MemberSlot) -> Result<Vec<Rule>> {
    let bridge = |slot: &MemberSlot| {
        slot.bridge
            .as_ref()
            .map(|h| h.addr().clone())
            .ok_or_else(|| HarnessError::BridgeRequired { name: slot.name().to_owned() })
    };
    Ok(vec![
        Rule { bridge: bridge(a)?, from: b.advertised().clone() },
        Rule { bridge: bridge(b)?, from: a.advertised().clone() },
    ])
}
