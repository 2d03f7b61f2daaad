use std::time::Duration;

use fleet_config::{MemberSpec, env};
use fleet_harness::admin::protocol::MemberState;
use fleet_harness::{HarnessError, RestartOptions, SetState};
use fleet_support::TestFleet;

#[tokio::test(start_paused = true)]
async fn initiate_converges_with_one_primary() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    assert_eq!(set.state(), SetState::Converged);
    assert_eq!(set.members().count(), 3);
    assert_eq!(set.config().version, 1);

    let primary = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let views = h.replsets.survey(&set).await;
    assert_eq!(views.iter().filter(|v| v.is_primary()).count(), 1);
    assert_eq!(views.iter().filter(|v| v.is_secondary()).count(), 2);
    assert!(views.iter().all(|v| v.primary() == Some(primary.addr())));

    h.teardown_set(&mut set).await.unwrap();
    assert_eq!(set.state(), SetState::TornDown);
}

#[tokio::test(start_paused = true)]
async fn writes_replicate_to_every_secondary() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;

    assert_eq!(fleet.sim.write("rs0", 25), 25);
    let h = &mut fleet.harness;
    h.replsets.await_replication(&h.procs, &set, env::default_timeout()).await.unwrap();

    let note = h.replsets.append_note(&mut set, "checkpoint").await.unwrap();
    h.replsets.await_replication(&h.procs, &set, env::default_timeout()).await.unwrap();
    let status = h.replsets.status(&set).await.unwrap();
    for member in status.members.iter().filter(|m| m.health == 1) {
        assert!(member.optime.is_some_and(|op| op >= note), "{} is behind", member.name);
    }

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn paused_member_times_out_replication_wait() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;
    let primary = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let lagging = set.members().find(|m| m.server.name() != primary.name()).unwrap().clone();

    fleet.sim.pause_replication(lagging.name(), true);
    fleet.sim.write("rs0", 5);
    let err = h
        .replsets
        .await_replication(&h.procs, &set, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ReplicationLagTimeout { .. }), "{err}");
    assert!(err.snapshot().is_some_and(|s| s.contains(lagging.name())), "{err}");

    fleet.sim.pause_replication(lagging.name(), false);
    h.replsets.await_replication(&h.procs, &set, env::default_timeout()).await.unwrap();
    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn add_and_remove_members() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let added = h.replsets.add_member(&mut h.procs, &mut set, MemberSpec::new(3)).await.unwrap();
    assert_eq!(set.members().count(), 4);
    assert_eq!(set.config().version, 2);
    assert!(h.procs.is_running(&added));
    let secondary = &[MemberState::Secondary];
    h.replsets.wait_for_state(&set, 3, secondary, env::default_timeout()).await.unwrap();

    h.replsets.remove_member(&mut h.procs, &mut set, 3).await.unwrap();
    assert_eq!(set.members().count(), 3);
    assert_eq!(set.config().version, 3);
    assert!(!h.procs.is_running(&added));
    assert!(set.member(3).is_err());

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn arbiter_holds_its_state() {
    let mut fleet = TestFleet::new();
    let topology = TestFleet::topology("rs0", 2).member(MemberSpec::arbiter(2));
    let h = &mut fleet.harness;
    let mut set = h.start_replica_set(&topology).await.unwrap();

    let state = h
        .replsets
        .wait_for_state(&set, 2, &[MemberState::Arbiter], env::default_timeout())
        .await
        .unwrap();
    assert_eq!(state, MemberState::Arbiter);
    let views = h.replsets.survey(&set).await;
    assert!(views.iter().any(|v| v.id == 2 && v.is_arbiter()));

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn restarted_member_rejoins_from_its_data() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    fleet.sim.write("rs0", 10);
    let h = &mut fleet.harness;
    h.replsets.await_replication(&h.procs, &set, env::default_timeout()).await.unwrap();

    let primary = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let id = set.members().find(|m| m.server.name() != primary.name()).unwrap().id;
    let old_pid = h.procs.pid(&set.member(id).unwrap().server).unwrap();

    let server = h
        .replsets
        .restart_member(&mut h.procs, &mut set, id, RestartOptions::default())
        .await
        .unwrap();
    assert_ne!(h.procs.pid(&server).unwrap(), old_pid);
    let secondary = &[MemberState::Secondary];
    h.replsets.wait_for_state(&set, id, secondary, env::default_timeout()).await.unwrap();
    h.replsets.await_converged(&h.procs, &mut set, env::default_timeout()).await.unwrap();

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn torn_down_set_rejects_operations() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 1).await;
    let h = &mut fleet.harness;
    h.teardown_set(&mut set).await.unwrap();

    let err = h.replsets.get_primary(&mut set, Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, HarnessError::TornDown { .. }), "{err}");
    assert_eq!(fleet.sim.live_processes(), 0);
}

/// Members that never hold an election leave the initiate waiting until it
/// gives up, with what the members last reported.
#[tokio::test(start_paused = true)]
async fn initiate_without_an_election_times_out() {
    let mut fleet = TestFleet::new();
    fleet.sim.hold_elections("rs0", true);
    let h = &mut fleet.harness;

    let Err(err) = h.start_replica_set(&TestFleet::topology("rs0", 3)).await else {
        panic!("initiate succeeded without an election");
    };
    let HarnessError::InitiateTimeout { ref set, waited, ref snapshot } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(set, "rs0");
    assert!(waited >= env::default_timeout(), "{waited:?}");
    assert!(!snapshot.is_empty());
    assert!(err.is_timeout());
    assert_eq!(err.snapshot(), Some(snapshot.as_str()));
}

/// The primary refuses a config that adds two voters at once. The members
/// started for it are stopped again and the set keeps its old config.
#[tokio::test(start_paused = true)]
async fn reconfig_adding_two_voters_is_rejected() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;
    let h = &mut fleet.harness;

    let topology = set.topology().with_member(MemberSpec::new(3)).with_member(MemberSpec::new(4));
    let err = h.replsets.reconfig(&mut h.procs, &mut set, &topology).await.unwrap_err();
    match &err {
        HarnessError::ReconfigRejected { set: name, reason } => {
            assert_eq!(name, "rs0");
            assert!(reason.contains("NewReplicaSetConfigurationIncompatible"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_timeout());

    assert_eq!(set.members().count(), 3);
    assert_eq!(set.config().version, 1);
    assert_eq!(fleet.sim.live_processes(), 3);

    // One voter at a time is fine.
    let h = &mut fleet.harness;
    h.replsets.add_member(&mut h.procs, &mut set, MemberSpec::new(3)).await.unwrap();
    assert_eq!(set.config().version, 2);
    h.teardown_set(&mut set).await.unwrap();
}
