//! Smoke test: replica set failover against real processes.
//!
//!   1. Start a 3-member set and wait for one primary
//!   2. Replicate a note to every secondary
//!   3. Kill the primary; a survivor takes over
//!   4. Restart the killed member; it rejoins as a secondary

use std::time::Duration;

use fleet_config::{TopologyConfig, env};
use fleet_harness::admin::protocol::MemberState;
use smoke::{SmokeFleet, require_server};

#[tokio::test]
async fn killed_primary_is_replaced_and_rejoins() {
    require_server!();
    let mut fleet = SmokeFleet::new();
    let h = &mut fleet.harness;

    let mut set = h.start_replica_set(&TopologyConfig::with_nodes("smoke-rs", 3)).await.unwrap();
    h.replsets.append_note(&mut set, "smoke").await.unwrap();
    h.replsets.await_replication(&h.procs, &set, env::default_timeout()).await.unwrap();

    let killed = h.faults.kill_primary(&mut h.procs, &mut set).await.unwrap();
    let new = h.replsets.get_primary(&mut set, Duration::from_secs(60)).await.unwrap();
    assert_ne!(killed.name(), new.name());

    h.faults.restart_after_crash(&mut h.procs, &killed).await.unwrap();
    let id = set.member_by_name(killed.name()).unwrap().id;
    h.replsets
        .wait_for_state(&set, id, &[MemberState::Secondary], Duration::from_secs(60))
        .await
        .unwrap();

    h.teardown_set(&mut set).await.unwrap();
}

#[tokio::test]
async fn step_down_hands_over() {
    require_server!();
    let mut fleet = SmokeFleet::new();
    let h = &mut fleet.harness;

    let mut set = h.start_replica_set(&TopologyConfig::with_nodes("smoke-sd", 3)).await.unwrap();
    let old = h.replsets.get_primary(&mut set, env::default_timeout()).await.unwrap();
    let new = h.replsets.step_down(&mut set, Duration::from_secs(30)).await.unwrap();
    assert_ne!(old.name(), new.name());

    h.teardown_set(&mut set).await.unwrap();
}
