use fleet_config::{HarnessSettings, TopologyFile};
use fleet_harness::{Harness, ReplicaSetHandle, ShardedClusterHandle};
use serde::Serialize;

use crate::error::CliError;
use crate::output::{self, OutputMode};

#[derive(Serialize)]
struct UpOutput {
    name: String,
    kind: &'static str,
    /// Connection string for sets, router addresses for clusters.
    connect: Vec<String>,
    data_dir: String,
}

pub async fn up(
    topology: &TopologyFile,
    settings: HarnessSettings,
    name: &str,
    mode: OutputMode,
) -> Result<(), CliError> {
    let data_dir = settings.data_dir.root().display().to_string();
    let mut harness = Harness::from_settings(settings);

    if let Some(set_topology) = topology.replica_sets.get(name) {
        let mut set = harness.start_replica_set(set_topology).await?;
        report(mode, set_output(&set, data_dir));
        wait_for_interrupt().await?;
        harness.teardown_set(&mut set).await?;
    } else if let Some(cluster_topology) = topology.clusters.get(name) {
        let mut cluster = harness.start_cluster(cluster_topology).await?;
        report(mode, cluster_output(&cluster, data_dir));
        wait_for_interrupt().await?;
        harness.teardown_cluster(&mut cluster).await?;
    } else {
        let known: Vec<&str> = topology
            .replica_sets
            .keys()
            .chain(topology.clusters.keys())
            .map(String::as_str)
            .collect();
        return Err(CliError::Arg(format!(
            "no replica set or cluster named {name} (known: {})",
            if known.is_empty() { "none".to_owned() } else { known.join(", ") }
        )));
    }
    tracing::info!(name, "torn down");
    Ok(())
}

fn set_output(set: &ReplicaSetHandle, data_dir: String) -> UpOutput {
    UpOutput {
        name: set.name().to_owned(),
        kind: "replica_set",
        connect: vec![set.connection_string()],
        data_dir,
    }
}

fn cluster_output(cluster: &ShardedClusterHandle, data_dir: String) -> UpOutput {
    UpOutput {
        name: cluster.name().to_owned(),
        kind: "sharded_cluster",
        connect: cluster.routers().iter().map(|r| r.addr().to_string()).collect(),
        data_dir,
    }
}

fn report(mode: OutputMode, out: UpOutput) {
    output::print(mode, &out, |o| {
        println!("{} {} is up", o.kind, o.name);
        for c in &o.connect {
            println!("  {c}");
        }
        println!("data: {}", o.data_dir);
        println!("press Ctrl-C to tear down");
    });
}

async fn wait_for_interrupt() -> Result<(), CliError> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, tearing down");
    Ok(())
}
