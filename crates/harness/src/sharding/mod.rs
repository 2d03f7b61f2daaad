//! Sharded clusters: a config server set, shard sets and routers.

mod chunks;

use fleet_config::{Check, ShardedTopology, WaitError, env, wait_until};

use crate::admin::protocol::AdminCommand;
use crate::admin::{Admin, AdminError};
use crate::error::{HarnessError, Result};
use crate::process::{ProcessHandle, ProcessManager, StartRequest, StopSignal};
use crate::replset::{ReplicaSetController, ReplicaSetHandle};

#[derive(Debug, Clone)]
pub struct ShardedClusterHandle {
    topology: ShardedTopology,
    config_servers: ReplicaSetHandle,
    shards: Vec<ReplicaSetHandle>,
    routers: Vec<ProcessHandle>,
    registered: Vec<String>,
    torn_down: bool,
}

impl ShardedClusterHandle {
    pub fn name(&self) -> &str {
        &self.topology.name
    }

    pub fn topology(&self) -> &ShardedTopology {
        &self.topology
    }

    pub fn config_servers(&self) -> &ReplicaSetHandle {
        &self.config_servers
    }

    pub fn config_servers_mut(&mut self) -> &mut ReplicaSetHandle {
        &mut self.config_servers
    }

    pub fn shards(&self) -> &[ReplicaSetHandle] {
        &self.shards
    }

    pub fn shard(&self, name: &str) -> Result<&ReplicaSetHandle> {
        self.shards
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| HarnessError::UnknownShard { name: name.to_owned() })
    }

    pub fn shard_mut(&mut self, name: &str) -> Result<&mut ReplicaSetHandle> {
        self.shards
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or_else(|| HarnessError::UnknownShard { name: name.to_owned() })
    }

    pub fn routers(&self) -> &[ProcessHandle] {
        &self.routers
    }

    /// Router `i`, in start order.
    pub fn router(&self, i: usize) -> Option<&ProcessHandle> {
        self.routers.get(i)
    }

    /// Shard names confirmed by `listShards`.
    pub fn registered_shards(&self) -> &[String] {
        &self.registered
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(HarnessError::TornDown { set: self.name().to_owned() });
        }
        Ok(())
    }
}

/// Bootstraps and drives sharded clusters. Cheap to clone.
#[derive(Clone)]
pub struct ShardedClusterController {
    admin: Admin,
    replsets: ReplicaSetController,
}

impl ShardedClusterController {
    pub fn new(admin: Admin) -> Self {
        Self { replsets: ReplicaSetController::new(admin.clone()), admin }
    }

    /// Bring up config servers, shards and routers, then register every
    /// shard through the first router.
    pub async fn bootstrap(
        &self,
        procs: &mut ProcessManager,
        topology: &ShardedTopology,
    ) -> Result<ShardedClusterHandle> {
        topology.validate()?;
        tracing::info!(
            cluster = %topology.name,
            shards = topology.shards.len(),
            routers = topology.routers,
            "bootstrapping sharded cluster"
        );

        let config_topology = topology.config_servers.clone().flag("configsvr");
        let config_servers = self.replsets.initiate(procs, &config_topology).await?;

        let mut shards = Vec::with_capacity(topology.shards.len());
        for shard in &topology.shards {
            shards.push(self.replsets.initiate(procs, &shard.clone().flag("shardsvr")).await?);
        }

        let configdb = config_servers.connection_string();
        let mut routers = Vec::with_capacity(topology.routers as usize);
        for i in 0..topology.routers {
            let req = StartRequest::router(format!("{}-router{i}", topology.name), &configdb)
                .options(&topology.router_options);
            routers.push(procs.start(req).await?);
        }

        let mut cluster = ShardedClusterHandle {
            topology: topology.clone(),
            config_servers,
            shards,
            routers,
            registered: Vec::new(),
            torn_down: false,
        };
        for shard in &cluster.shards {
            self.add_shard(&cluster.routers[0], shard).await?;
        }
        cluster.registered = self.await_registered(&cluster).await?;
        tracing::info!(
            cluster = %cluster.name(),
            shards = ?cluster.registered,
            "sharded cluster ready"
        );
        Ok(cluster)
    }

    async fn add_shard(&self, router: &ProcessHandle, shard: &ReplicaSetHandle) -> Result<()> {
        let cmd = AdminCommand::AddShard {
            name: shard.name().to_owned(),
            connection: shard.connection_string(),
        };
        let (admin, router, cmd) = (&self.admin, router.addr(), &cmd);
        let what = format!("addShard {}", shard.name());
        let outcome = wait_until(what, env::default_timeout(), move || async move {
            admin.run(router, cmd).await?;
            Ok::<_, AdminError>(Check::Ready(()))
        })
        .fail_fast(|e: &AdminError| !e.is_transient())
        .await;
        outcome.map_err(|e| HarnessError::ShardRegistrationFailed {
            shard: shard.name().to_owned(),
            reason: match e {
                WaitError::Timeout(t) => t.to_string(),
                WaitError::Aborted(e) => e.to_string(),
            },
        })
    }

    /// Wait until `listShards` shows every shard of the cluster.
    async fn await_registered(&self, cluster: &ShardedClusterHandle) -> Result<Vec<String>> {
        let wanted: Vec<String> = cluster.shards.iter().map(|s| s.name().to_owned()).collect();
        let (admin, wanted_ref) = (&self.admin, &wanted);
        let router = cluster.routers[0].addr();
        let what = format!("shards of {} to register", cluster.name());
        let outcome = wait_until(what, env::default_timeout(), move || async move {
            let listed = admin.list_shards(router).await?;
            let missing: Vec<&str> = wanted_ref
                .iter()
                .filter(|w| !listed.iter().any(|s| &s.id == *w))
                .map(String::as_str)
                .collect();
            Ok::<_, AdminError>(if missing.is_empty() {
                Check::Ready(())
            } else {
                Check::pending(format!("missing {}", missing.join(", ")))
            })
        })
        .await;
        match outcome {
            Ok(()) => Ok(wanted),
            Err(e) => Err(HarnessError::ShardRegistrationFailed {
                shard: wanted.join(","),
                reason: e.to_string(),
            }),
        }
    }

    /// Stop routers, then shards, then config servers.
    pub async fn teardown(
        &self,
        procs: &mut ProcessManager,
        cluster: &mut ShardedClusterHandle,
    ) -> Result<()> {
        if cluster.torn_down {
            return Ok(());
        }
        tracing::info!(cluster = %cluster.name(), "tearing down sharded cluster");
        let mut first_err = None;
        for router in &cluster.routers {
            if let Err(e) = procs.stop(router, StopSignal::Graceful).await {
                first_err.get_or_insert(e);
            }
        }
        for shard in &mut cluster.shards {
            if let Err(e) = self.replsets.stop_set(procs, shard).await {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.replsets.stop_set(procs, &mut cluster.config_servers).await {
            first_err.get_or_insert(e);
        }
        cluster.torn_down = true;
        first_err.map_or(Ok(()), Err)
    }
}
