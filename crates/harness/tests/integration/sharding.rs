use std::time::Duration;

use fleet_config::env;
use fleet_harness::admin::protocol::KeyBound;
use fleet_harness::{AdminError, HarnessError};
use fleet_support::TestFleet;

const NS: &str = "app.events";

#[tokio::test(start_paused = true)]
async fn bootstrap_registers_every_shard() {
    let mut fleet = TestFleet::new();
    let mut cluster = fleet.cluster("c", 2, 1).await;
    let h = &mut fleet.harness;

    assert_eq!(cluster.registered_shards(), ["c-rs0", "c-rs1"]);
    assert_eq!(cluster.routers().len(), 1);
    let shards = h.sharding.shards(&cluster).await.unwrap();
    assert_eq!(shards.len(), 2);
    assert!(shards[0].host.starts_with("c-rs0/"), "{}", shards[0].host);

    h.teardown_cluster(&mut cluster).await.unwrap();
    assert!(cluster.is_torn_down());
    assert_eq!(fleet.sim.live_processes(), 0);
}

#[tokio::test(start_paused = true)]
async fn split_and_move_chunks() {
    let mut fleet = TestFleet::new();
    let mut cluster = fleet.cluster("c", 2, 1).await;
    let h = &mut fleet.harness;

    h.sharding.shard_collection(&mut cluster, NS, "user_id").await.unwrap();
    let chunks = h.sharding.chunks(&cluster, NS).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!((chunks[0].min, chunks[0].max), (KeyBound::MinKey, KeyBound::MaxKey));

    h.sharding.split_chunk(&mut cluster, NS, 100).await.unwrap();
    // Splitting at an existing boundary changes nothing.
    h.sharding.split_chunk(&mut cluster, NS, 100).await.unwrap();
    assert_eq!(h.sharding.chunks(&cluster, NS).await.unwrap().len(), 2);

    h.sharding.move_chunk(&mut cluster, NS, 150, "c-rs1").await.unwrap();
    let dist = h.sharding.chunk_distribution(&cluster, NS).await.unwrap();
    assert_eq!(dist.get("c-rs0"), Some(&1));
    assert_eq!(dist.get("c-rs1"), Some(&1));

    let moved = h.sharding.chunks(&cluster, NS).await.unwrap();
    let upper = moved.iter().find(|c| c.contains(150)).unwrap();
    assert_eq!(upper.shard, "c-rs1");
    assert_eq!(upper.min, KeyBound::Value(100));

    h.teardown_cluster(&mut cluster).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn move_to_unknown_shard_fails() {
    let mut fleet = TestFleet::new();
    let mut cluster = fleet.cluster("c", 2, 1).await;
    let h = &mut fleet.harness;
    h.sharding.shard_collection(&mut cluster, NS, "user_id").await.unwrap();

    let err = h.sharding.move_chunk(&mut cluster, NS, 0, "nope").await.unwrap_err();
    assert!(matches!(err, HarnessError::UnknownShard { .. }), "{err}");

    let err = h.sharding.split_chunk(&mut cluster, "app.missing", 5).await.unwrap_err();
    let code = match &err {
        HarnessError::Admin(AdminError::Command { code_name, .. }) => code_name.as_str(),
        _ => "",
    };
    assert_eq!(code, "NamespaceNotFound", "{err}");

    h.teardown_cluster(&mut cluster).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn balancer_evens_out_chunks() {
    let mut fleet = TestFleet::new();
    let mut cluster = fleet.cluster("c", 2, 1).await;
    let h = &mut fleet.harness;

    h.sharding.shard_collection(&mut cluster, NS, "user_id").await.unwrap();
    for at in [10, 20, 30] {
        h.sharding.split_chunk(&mut cluster, NS, at).await.unwrap();
    }
    let before = h.sharding.chunk_distribution(&cluster, NS).await.unwrap();
    assert_eq!(before.values().copied().collect::<Vec<_>>(), [4, 0]);

    let status = h.sharding.balancer_status(&cluster).await.unwrap();
    assert_eq!(status.mode, "off");

    h.sharding.balancer_start(&cluster).await.unwrap();
    for _ in 0..3 {
        h.sharding.await_balancer_round(&cluster, env::default_timeout()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = h.sharding.chunk_distribution(&cluster, NS).await.unwrap();
    assert_eq!(after.values().copied().collect::<Vec<_>>(), [2, 2]);

    h.sharding.balancer_stop(&cluster).await.unwrap();
    assert_eq!(h.sharding.balancer_status(&cluster).await.unwrap().mode, "off");
    h.teardown_cluster(&mut cluster).await.unwrap();
}

/// Killing a shard's primary and letting the set fail over leaves chunk
/// operations working.
#[tokio::test(start_paused = true)]
async fn chunk_moves_survive_shard_failover() {
    let mut fleet = TestFleet::new();
    let mut cluster = fleet.cluster("c", 2, 3).await;
    let h = &mut fleet.harness;
    h.sharding.shard_collection(&mut cluster, NS, "user_id").await.unwrap();
    h.sharding.split_chunk(&mut cluster, NS, 0).await.unwrap();

    let shard = cluster.shard_mut("c-rs1").unwrap();
    h.faults.kill_primary(&mut h.procs, shard).await.unwrap();
    h.replsets.get_primary(shard, env::default_timeout()).await.unwrap();

    h.sharding.move_chunk(&mut cluster, NS, 5, "c-rs1").await.unwrap();
    let dist = h.sharding.chunk_distribution(&cluster, NS).await.unwrap();
    assert_eq!(dist.get("c-rs1"), Some(&1));

    h.teardown_cluster(&mut cluster).await.unwrap();
}

/// A shard the config servers refuse fails the bootstrap by name.
#[tokio::test(start_paused = true)]
async fn refused_shard_fails_bootstrap() {
    let mut fleet = TestFleet::new();
    fleet.sim.refuse_shard("c-rs1", true);
    let topology = TestFleet::sharded_topology("c", 2, 1);
    let h = &mut fleet.harness;

    let Err(err) = h.start_cluster(&topology).await else {
        panic!("bootstrap succeeded with a refused shard");
    };
    match &err {
        HarnessError::ShardRegistrationFailed { shard, reason } => {
            assert_eq!(shard, "c-rs1");
            assert!(reason.contains("OperationFailed"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_timeout());
}
