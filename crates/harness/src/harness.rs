use std::sync::Arc;

use fleet_config::{HarnessSettings, ShardedTopology, TopologyConfig};

use crate::admin::http::HttpAdminTransport;
use crate::admin::{Admin, AdminTransport};
use crate::error::Result;
use crate::faults::FaultInjector;
use crate::process::{BinaryLauncher, Launcher, ProcessHandle, ProcessManager};
use crate::replset::{ReplicaSetController, ReplicaSetHandle};
use crate::sharding::{ShardedClusterController, ShardedClusterHandle};

/// Everything a test needs to drive a fleet.
///
/// The parts are public fields so a test can borrow the process manager
/// mutably while calling a controller:
///
/// ```ignore
/// let h = &mut harness;
/// h.replsets.step_down(&mut set, Duration::from_secs(10)).await?;
/// h.faults.kill_member(&mut h.procs, &mut set, 1).await?;
/// ```
pub struct Harness {
    pub procs: ProcessManager,
    pub replsets: ReplicaSetController,
    pub sharding: ShardedClusterController,
    pub faults: FaultInjector,
}

impl Harness {
    /// Launch real binaries and talk to them over HTTP.
    pub fn from_settings(settings: HarnessSettings) -> Self {
        Self::new(settings, Arc::new(BinaryLauncher::new()), Arc::new(HttpAdminTransport::new()))
    }

    pub fn new(
        settings: HarnessSettings,
        launcher: Arc<dyn Launcher>,
        transport: Arc<dyn AdminTransport>,
    ) -> Self {
        let admin = Admin::new(transport);
        let replsets = ReplicaSetController::new(admin.clone());
        Self {
            procs: ProcessManager::new(settings, launcher, admin.clone()),
            faults: FaultInjector::new(replsets.clone()),
            sharding: ShardedClusterController::new(admin),
            replsets,
        }
    }

    pub fn admin(&self) -> &Admin {
        self.replsets.admin()
    }

    pub async fn start_replica_set(
        &mut self,
        topology: &TopologyConfig,
    ) -> Result<ReplicaSetHandle> {
        self.replsets.initiate(&mut self.procs, topology).await
    }

    pub async fn start_cluster(
        &mut self,
        topology: &ShardedTopology,
    ) -> Result<ShardedClusterHandle> {
        self.sharding.bootstrap(&mut self.procs, topology).await
    }

    /// Heal the faults on `set`'s members, then stop every process of `set`.
    /// Faults on other sets are left alone.
    pub async fn teardown_set(&mut self, set: &mut ReplicaSetHandle) -> Result<()> {
        let healed = self.faults.release(&servers_of(set)).await;
        self.replsets.stop_set(&mut self.procs, set).await?;
        healed
    }

    /// Heal the faults on the cluster's processes, then stop routers, shards
    /// and config servers.
    pub async fn teardown_cluster(&mut self, cluster: &mut ShardedClusterHandle) -> Result<()> {
        let mut servers = servers_of(cluster.config_servers());
        servers.extend(cluster.shards().iter().flat_map(servers_of));
        servers.extend(cluster.routers().iter().cloned());
        let healed = self.faults.release(&servers).await;
        self.sharding.teardown(&mut self.procs, cluster).await?;
        healed
    }
}

fn servers_of(set: &ReplicaSetHandle) -> Vec<ProcessHandle> {
    set.all_slots().iter().map(|m| m.server.clone()).collect()
}
