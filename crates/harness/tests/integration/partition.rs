use std::time::Duration;

use fleet_config::{Check, env, wait_until};
use fleet_harness::{FaultKind, HarnessError, RestartOptions, SetState, StopSignal};
use fleet_support::TestFleet;

/// Cut the primary off from both secondaries. The majority side elects a new
/// primary, the old one steps down, and after healing everyone agrees.
#[tokio::test(start_paused = true)]
async fn isolated_primary_is_replaced() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.bridged_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let old = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let old_id = set.member_by_name(old.name()).unwrap().id;
    let faults = h.faults.isolate_member(&mut set, old_id).await.unwrap();
    assert_eq!(faults.len(), 2);
    assert_eq!(set.state(), SetState::Degraded);

    // The old primary keeps answering while it steps down, so wait for the
    // majority side alone to hold the only primary.
    let (replsets, view) = (&h.replsets, &set);
    let new_id = wait_until("a primary on the majority side", env::default_timeout(), move || {
        async move {
            let views = replsets.survey(view).await;
            let primaries: Vec<u32> =
                views.iter().filter(|v| v.is_primary()).map(|v| v.id).collect();
            Ok::<_, HarnessError>(match primaries[..] {
                [id] if id != old_id => Check::Ready(id),
                _ => Check::pending(format!("primaries: {primaries:?}")),
            })
        }
    })
    .await
    .unwrap();
    let new = set.member(new_id).unwrap().name().to_owned();

    assert_eq!(h.faults.heal_members(&set).await.unwrap(), 2);
    assert_eq!(h.faults.active().count(), 0);
    let agreed = h
        .replsets
        .await_nodes_agree_on_primary(&mut set, None, env::default_timeout())
        .await
        .unwrap();
    assert_eq!(agreed.name(), new);
    h.replsets.await_converged(&h.procs, &mut set, env::default_timeout()).await.unwrap();
    assert_eq!(set.state(), SetState::Converged);

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn partition_is_idempotent_per_pair() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.bridged_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let first = h.faults.partition_members(&mut set, 0, 1).await.unwrap();
    let again = h.faults.partition_members(&mut set, 1, 0).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(h.faults.active().count(), 1);

    let (a, b) = (set.member(0).unwrap().clone(), set.member(1).unwrap().clone());
    assert!(h.faults.heal_partition(&a, &b).await.unwrap());
    assert!(!h.faults.heal_partition(&a, &b).await.unwrap());

    h.teardown_set(&mut set).await.unwrap();
}

/// A timed partition lifts itself on the next injector call after it expires.
#[tokio::test(start_paused = true)]
async fn timed_partition_heals_on_expiry() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.bridged_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let (a, b) = (set.member(0).unwrap().clone(), set.member(2).unwrap().clone());
    let id = h.faults.partition_for(&a, &b, Duration::from_millis(300)).await.unwrap();
    assert!(h.faults.get(id).unwrap().heal_at.is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.faults.heal_expired().await.unwrap(), vec![id]);
    assert!(h.faults.get(id).is_none());

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delayed_link_still_replicates() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.bridged_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let primary = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let p = set.member_by_name(primary.name()).unwrap().clone();
    let other = set.members().find(|m| m.id != p.id).unwrap().clone();
    let id = h.faults.delay(&p, &other, Duration::from_millis(100), None).await.unwrap();
    assert_eq!(h.faults.get(id).unwrap().kind, FaultKind::Delay(Duration::from_millis(100)));

    // Replacing the delay on the same pair keeps one record.
    let replaced = h.faults.delay(&p, &other, Duration::from_millis(50), None).await.unwrap();
    assert_eq!(h.faults.active().filter(|f| f.kind != FaultKind::Partition).count(), 1);
    assert_eq!(h.faults.get(replaced).unwrap().kind, FaultKind::Delay(Duration::from_millis(50)));

    fleet.sim.write("rs0", 10);
    h.replsets.await_replication(&h.procs, &set, env::default_timeout()).await.unwrap();

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn network_faults_need_bridges() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let err = h.faults.partition_members(&mut set, 0, 1).await.unwrap_err();
    assert!(matches!(err, HarnessError::BridgeRequired { .. }), "{err}");
    assert_eq!(h.faults.active().count(), 0);

    h.teardown_set(&mut set).await.unwrap();
}

/// When the second bridge of a pair is gone, the rule already put on the
/// first one is taken back off and nothing is recorded.
#[tokio::test(start_paused = true)]
async fn failed_partition_leaves_no_rule_behind() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.bridged_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let (a, b) = (set.member(0).unwrap().clone(), set.member(1).unwrap().clone());
    let (a_bridge, b_bridge) = (a.bridge.clone().unwrap(), b.bridge.clone().unwrap());
    h.procs.stop(&b_bridge, StopSignal::Kill).await.unwrap();

    let err = h.faults.partition(&a, &b).await.unwrap_err();
    assert!(matches!(&err, HarnessError::Admin(e) if e.is_network()), "{err}");
    assert_eq!(h.faults.active().count(), 0);
    assert!(fleet.sim.bridge_rules(a_bridge.name()).is_empty());

    // Same for a delay: the first bridge ends up with no delay rule.
    let err = h.faults.delay(&a, &b, Duration::from_millis(100), None).await.unwrap_err();
    assert!(matches!(err, HarnessError::Admin(_)), "{err}");
    assert_eq!(h.faults.active().count(), 0);
    assert!(fleet.sim.bridge_rules(a_bridge.name()).is_empty());

    // The surviving pair still partitions and heals cleanly.
    let c = set.member(2).unwrap().clone();
    h.faults.partition(&a, &c).await.unwrap();
    assert_eq!(fleet.sim.bridge_rules(a_bridge.name()), vec![c.advertised().clone()]);
    assert!(h.faults.heal_partition(&a, &c).await.unwrap());
    assert!(fleet.sim.bridge_rules(a_bridge.name()).is_empty());

    h.teardown_set(&mut set).await.unwrap();
}

/// A replacement delay that cannot be installed puts the old delay back.
#[tokio::test(start_paused = true)]
async fn failed_delay_restores_the_previous_one() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.bridged_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let (a, b) = (set.member(0).unwrap().clone(), set.member(1).unwrap().clone());
    let a_bridge = a.bridge.clone().unwrap();
    let first = h.faults.delay(&a, &b, Duration::from_millis(40), None).await.unwrap();

    h.procs.stop(b.bridge.as_ref().unwrap(), StopSignal::Kill).await.unwrap();
    h.faults.delay(&a, &b, Duration::from_millis(80), None).await.unwrap_err();

    let kept = h.faults.get(first).unwrap();
    assert_eq!(kept.kind, FaultKind::Delay(Duration::from_millis(40)));
    assert_eq!(h.faults.active().count(), 1);
    assert_eq!(fleet.sim.bridge_rules(a_bridge.name()), vec![b.advertised().clone()]);

    let b_bridge = b.bridge.as_ref().unwrap();
    h.procs.restart(b_bridge, RestartOptions::default()).await.unwrap();
    h.teardown_set(&mut set).await.unwrap();
    assert_eq!(h.faults.active().count(), 0);
}

/// Tearing one set down heals only its own faults. A partition inside a
/// second set keeps cutting traffic until that set is healed.
#[tokio::test(start_paused = true)]
async fn teardown_heals_only_its_own_set() {
    let mut fleet = TestFleet::new();
    let mut left = fleet.bridged_set("rs0", 3).await;
    let mut right = fleet.bridged_set("rs1", 3).await;
    let h = &mut fleet.harness;

    h.faults.kill_member(&mut h.procs, &mut left, 2).await.unwrap();
    h.faults.partition_members(&mut left, 0, 1).await.unwrap();
    let cut = h.faults.partition_members(&mut right, 0, 1).await.unwrap();
    assert_eq!(h.faults.active().count(), 3);

    h.teardown_set(&mut left).await.unwrap();
    let remaining: Vec<_> = h.faults.active().map(|f| f.id).collect();
    assert_eq!(remaining, vec![cut]);
    let right_bridge = right.member(0).unwrap().bridge.clone().unwrap();
    assert!(!fleet.sim.bridge_rules(right_bridge.name()).is_empty());

    h.faults.heal_all().await.unwrap();
    assert_eq!(h.faults.active().count(), 0);
    assert!(fleet.sim.bridge_rules(right_bridge.name()).is_empty());
    h.teardown_set(&mut right).await.unwrap();
}
