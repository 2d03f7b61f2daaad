//! Smoke test: a two-shard cluster behind one router.
//!
//!   1. Bootstrap config servers, shards and router
//!   2. Shard a collection, split it and move half to the other shard
//!   3. Tear everything down

use fleet_config::ShardedTopology;
use smoke::{SmokeFleet, require_server};

const NS: &str = "smoke.events";

#[tokio::test]
async fn split_and_move_across_shards() {
    require_server!();
    let mut fleet = SmokeFleet::new();
    let h = &mut fleet.harness;

    let mut cluster = h.start_cluster(&ShardedTopology::new("smoke", 2, 1)).await.unwrap();
    assert_eq!(cluster.registered_shards().len(), 2);

    h.sharding.shard_collection(&mut cluster, NS, "k").await.unwrap();
    h.sharding.split_chunk(&mut cluster, NS, 0).await.unwrap();
    h.sharding.move_chunk(&mut cluster, NS, -1, "smoke-rs0").await.unwrap();
    h.sharding.move_chunk(&mut cluster, NS, 0, "smoke-rs1").await.unwrap();

    let dist = h.sharding.chunk_distribution(&cluster, NS).await.unwrap();
    assert_eq!(dist.values().sum::<usize>(), 2);
    assert!(dist.values().all(|&n| n == 1), "{dist:?}");

    h.teardown_cluster(&mut cluster).await.unwrap();
}
