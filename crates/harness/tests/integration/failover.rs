use std::time::Duration;

use fleet_config::{MemberSpec, env};
use fleet_harness::admin::protocol::MemberState;
use fleet_harness::{FaultKind, HarnessError, LifecycleState, SetState};
use fleet_support::TestFleet;

/// Step the primary down and check a different member takes over and the old
/// one settles as a secondary.
#[tokio::test(start_paused = true)]
async fn step_down_elects_a_different_primary() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let old = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let new = h.replsets.step_down(&mut set, Duration::from_secs(5)).await.unwrap();
    assert_ne!(old.name(), new.name());
    assert_eq!(set.last_known_primary().map(|m| m.name()), Some(new.name()));

    let old_id = set.member_by_name(old.name()).unwrap().id;
    h.replsets
        .wait_for_state(&set, old_id, &[MemberState::Secondary], env::default_timeout())
        .await
        .unwrap();
    h.replsets.await_nodes_agree_on_primary(&mut set, None, env::default_timeout()).await.unwrap();

    h.teardown_set(&mut set).await.unwrap();
}

/// A lone member has nobody to hand over to, so the step-down is refused.
#[tokio::test(start_paused = true)]
async fn step_down_without_an_electable_secondary_fails() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 1).await;
    let h = &mut fleet.harness;

    let err = h.replsets.step_down(&mut set, Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(
        match &err {
            HarnessError::Admin(e) => e.code_name(),
            _ => None,
        },
        Some("ExceededTimeLimit"),
        "{err}"
    );
    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn killed_primary_is_replaced() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let killed = h.faults.kill_primary(&mut h.procs, &mut set).await.unwrap();
    assert_eq!(set.state(), SetState::Degraded);
    assert_eq!(h.procs.state(&killed).unwrap(), LifecycleState::Stopped);
    assert_eq!(h.procs.last_exit(&killed).unwrap().and_then(|e| e.signal), Some(9));
    assert!(h.faults.active().any(|f| f.kind == FaultKind::Kill));

    let new = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    assert_ne!(new.name(), killed.name());

    // The old primary comes back as a secondary of the new one.
    let id = set.member_by_name(killed.name()).unwrap().id;
    h.faults.restart_after_crash(&mut h.procs, &killed).await.unwrap();
    h.replsets
        .wait_for_state(&set, id, &[MemberState::Secondary], env::default_timeout())
        .await
        .unwrap();
    let agreed = h
        .replsets
        .await_nodes_agree_on_primary(&mut set, None, env::default_timeout())
        .await
        .unwrap();
    assert_eq!(agreed.name(), new.name());

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn majority_loss_leaves_no_primary() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let primary = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let secondaries: Vec<u32> =
        set.members().filter(|m| m.server.name() != primary.name()).map(|m| m.id).collect();
    for id in secondaries {
        h.faults.kill_member(&mut h.procs, &mut set, id).await.unwrap();
    }

    h.replsets.await_no_primary(&mut set, env::default_timeout()).await.unwrap();
    let err = h.replsets.get_primary(&mut set, Duration::from_millis(500)).await.unwrap_err();
    assert!(err.is_timeout(), "{err}");

    let err = h.replsets.await_new_primary(&mut set, &primary, Duration::from_secs(2)).await;
    match err.unwrap_err() {
        HarnessError::NoNewPrimaryElected { set: name, old_primary, snapshot } => {
            assert_eq!(name, "rs0");
            assert_eq!(old_primary, primary.name());
            assert!(!snapshot.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }

    // With nobody primary there is nothing to step down.
    let err = h.replsets.step_down(&mut set, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, HarnessError::NoNewPrimaryElected { .. }), "{err}");

    h.teardown_set(&mut set).await.unwrap();
}

/// Losing the primary and one of two secondaries leaves the survivor without
/// a majority, so no replacement is ever elected.
#[tokio::test(start_paused = true)]
async fn killed_primary_without_a_majority_is_not_replaced() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let killed = h.faults.kill_primary(&mut h.procs, &mut set).await.unwrap();
    let secondary = set.members().find(|m| m.server.name() != killed.name()).unwrap().id;
    h.faults.kill_member(&mut h.procs, &mut set, secondary).await.unwrap();

    let err = h
        .replsets
        .await_new_primary(&mut set, &killed, Duration::from_secs(5))
        .await
        .unwrap_err();
    let HarnessError::NoNewPrimaryElected { ref old_primary, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(old_primary, killed.name());
    assert!(err.is_timeout());
    assert!(err.to_string().contains(killed.name()), "{err}");

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn step_up_moves_the_primary() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let old = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let target = set.members().find(|m| m.server.name() != old.name()).unwrap().id;
    let new = h.replsets.step_up(&mut set, target).await.unwrap();
    assert_eq!(new.name(), set.member(target).unwrap().name());

    h.replsets
        .await_nodes_agree_on_primary(&mut set, Some(target), env::default_timeout())
        .await
        .unwrap();
    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn frozen_member_sits_out_the_election() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let old = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let others: Vec<u32> =
        set.members().filter(|m| m.server.name() != old.name()).map(|m| m.id).collect();
    let (frozen, expected) = (others[0], others[1]);

    h.replsets.freeze(&set, frozen, Duration::from_secs(60)).await.unwrap();
    let new = h.replsets.step_down(&mut set, Duration::from_secs(60)).await.unwrap();
    assert_eq!(new.name(), set.member(expected).unwrap().name());

    h.replsets.unfreeze(&set, frozen).await.unwrap();
    h.teardown_set(&mut set).await.unwrap();
}

/// With one member at a higher priority, the set ends up with that member as
/// primary even after it is stepped down.
#[tokio::test(start_paused = true)]
async fn highest_priority_member_takes_over() {
    let mut fleet = TestFleet::new();
    let topology = TestFleet::topology("rs0", 0)
        .member(MemberSpec::new(0))
        .member(MemberSpec::new(1))
        .member(MemberSpec::new(2).priority(5.0));
    let h = &mut fleet.harness;
    let mut set = h.start_replica_set(&topology).await.unwrap();

    let primary = h
        .replsets
        .await_highest_priority_primary(&mut set, env::default_timeout())
        .await
        .unwrap();
    assert_eq!(primary.name(), set.member(2).unwrap().name());

    h.replsets.step_down(&mut set, Duration::from_secs(1)).await.unwrap();
    let back = h
        .replsets
        .await_highest_priority_primary(&mut set, env::default_timeout())
        .await
        .unwrap();
    assert_eq!(back.name(), primary.name());

    h.teardown_set(&mut set).await.unwrap();
}
