use std::time::Duration;

use fleet_config::env;
use fleet_harness::ParallelAction;
use fleet_support::TestFleet;

/// Keep writing on whatever member is primary while the test steps the
/// primary down, then check the writer saw the failover and the set caught
/// up.
#[tokio::test(start_paused = true)]
async fn writer_runs_through_a_step_down() {
    let mut fleet = TestFleet::new();
    let mut set = fleet.replica_set("rs0", 3).await;

    let sim = fleet.sim.clone();
    let writer = ParallelAction::spawn("writer", async move {
        let (mut written, mut refused) = (0, 0);
        for _ in 0..60 {
            match sim.write("rs0", 1) {
                0 => refused += 1,
                n => written += n,
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok((written, refused))
    });

    let h = &mut fleet.harness;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.replsets.step_down(&mut set, Duration::from_secs(5)).await.unwrap();

    let (written, _refused) = writer.join().await.unwrap();
    assert!(written > 0);
    h.replsets.await_replication(&h.procs, &set, env::default_timeout()).await.unwrap();
    h.teardown_set(&mut set).await.unwrap();
}
