use std::path::Path;

use fleet_config::TopologyConfig;
use serde::Serialize;

use crate::error::CliError;
use crate::output::{self, OutputMode, table};

#[derive(Debug, Serialize)]
pub struct TopologySummary {
    pub name: String,
    pub kind: &'static str,
    pub members: usize,
    /// Voting majority; `None` for clusters.
    pub majority: Option<usize>,
    pub bridged: bool,
}

impl TopologySummary {
    fn replica_set(name: &str, t: &TopologyConfig) -> Self {
        Self {
            name: name.to_owned(),
            kind: "replica_set",
            members: t.members.len(),
            majority: Some(t.majority()),
            bridged: t.use_bridge,
        }
    }
}

pub fn validate(file: &Path, mode: OutputMode) -> Result<(), CliError> {
    let topology = super::load(file)?;

    let mut summaries: Vec<TopologySummary> = topology
        .replica_sets
        .iter()
        .map(|(name, t)| TopologySummary::replica_set(name, t))
        .collect();
    for (name, cluster) in &topology.clusters {
        let members = cluster.config_servers.members.len()
            + cluster.shards.iter().map(|s| s.members.len()).sum::<usize>()
            + cluster.routers as usize;
        summaries.push(TopologySummary {
            name: name.clone(),
            kind: "sharded_cluster",
            members,
            majority: None,
            bridged: cluster.shards.iter().any(|s| s.use_bridge),
        });
    }

    output::print(mode, &summaries, |s| {
        if s.is_empty() {
            println!("{}: valid, no topologies defined", file.display());
        } else {
            table::print_topologies(s);
        }
    });
    Ok(())
}
