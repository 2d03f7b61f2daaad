use std::collections::BTreeMap;
use std::time::Duration;

use fleet_config::{Check, HostAddr, env, wait_until};

use super::{ShardedClusterController, ShardedClusterHandle};
use crate::admin::AdminError;
use crate::admin::protocol::{AdminCommand, BalancerStatus, ChunkInfo, KeyBound, ShardInfo};
use crate::error::{HarnessError, Result};

impl ShardedClusterController {
    /// Shard `ns` on `key`. Returns once the router has chunk metadata for it.
    pub async fn shard_collection(
        &self,
        cluster: &mut ShardedClusterHandle,
        ns: &str,
        key: &str,
    ) -> Result<()> {
        let router = self.ready_router(cluster).await?;
        let cmd = AdminCommand::ShardCollection { ns: ns.to_owned(), key: key.to_owned() };
        self.admin.run(&router, &cmd).await?;

        let (admin, router) = (&self.admin, &router);
        wait_until(format!("chunks for {ns}"), env::default_timeout(), move || async move {
            let chunks = admin.list_chunks(router, ns).await?;
            Ok::<_, AdminError>(Check::from(!chunks.is_empty()))
        })
        .await?;
        tracing::info!(cluster = %cluster.name(), ns, key, "collection sharded");
        Ok(())
    }

    /// Split the chunk holding `at` so that a new chunk starts at `at`.
    pub async fn split_chunk(
        &self,
        cluster: &mut ShardedClusterHandle,
        ns: &str,
        at: i64,
    ) -> Result<()> {
        let router = self.ready_router(cluster).await?;
        let owner = self.owner_of(&router, ns, at).await?;
        if owner.min == KeyBound::Value(at) {
            return Ok(());
        }
        self.await_shard_primary(cluster, &owner.shard).await?;

        let cmd = AdminCommand::Split { ns: ns.to_owned(), middle: at };
        self.admin.run(&router, &cmd).await?;

        let (admin, router) = (&self.admin, &router);
        let what = format!("split of {ns} at {at}");
        wait_until(what, env::default_timeout(), move || async move {
            let chunks = admin.list_chunks(router, ns).await?;
            Ok::<_, AdminError>(Check::from(chunks.iter().any(|c| c.min == KeyBound::Value(at))))
        })
        .await?;
        tracing::info!(cluster = %cluster.name(), ns, at, "chunk split");
        Ok(())
    }

    /// Move the chunk holding `find` to shard `to` and wait until the router
    /// reports the new owner.
    pub async fn move_chunk(
        &self,
        cluster: &mut ShardedClusterHandle,
        ns: &str,
        find: i64,
        to: &str,
    ) -> Result<()> {
        cluster.shard(to)?;
        let router = self.ready_router(cluster).await?;
        let owner = self.owner_of(&router, ns, find).await?;
        if owner.shard == to {
            return Ok(());
        }
        self.await_shard_primary(cluster, &owner.shard).await?;
        self.await_shard_primary(cluster, to).await?;

        let cmd = AdminCommand::MoveChunk { ns: ns.to_owned(), find, to: to.to_owned() };
        self.admin.run(&router, &cmd).await?;

        let (admin, router) = (&self.admin, &router);
        let what = format!("chunk of {ns} holding {find} to move to {to}");
        wait_until(what, env::default_timeout(), move || async move {
            let chunks = admin.list_chunks(router, ns).await?;
            Ok::<_, AdminError>(match chunks.iter().find(|c| c.contains(find)) {
                Some(c) if c.shard == to => Check::Ready(()),
                Some(c) => Check::pending(format!("still on {}", c.shard)),
                None => Check::pending("no chunk holds the key"),
            })
        })
        .await?;
        tracing::info!(cluster = %cluster.name(), ns, find, from = %owner.shard, to, "chunk moved");
        Ok(())
    }

    pub async fn chunks(&self, cluster: &ShardedClusterHandle, ns: &str) -> Result<Vec<ChunkInfo>> {
        let router = self.ready_router(cluster).await?;
        Ok(self.admin.list_chunks(&router, ns).await?)
    }

    /// Number of chunks of `ns` per shard, including shards that own none.
    pub async fn chunk_distribution(
        &self,
        cluster: &ShardedClusterHandle,
        ns: &str,
    ) -> Result<BTreeMap<String, usize>> {
        let mut counts: BTreeMap<String, usize> =
            cluster.shards().iter().map(|s| (s.name().to_owned(), 0)).collect();
        for chunk in self.chunks(cluster, ns).await? {
            *counts.entry(chunk.shard).or_default() += 1;
        }
        Ok(counts)
    }

    /// The shard list as the config servers hold it.
    pub async fn shards(&self, cluster: &ShardedClusterHandle) -> Result<Vec<ShardInfo>> {
        let router = self.ready_router(cluster).await?;
        Ok(self.admin.list_shards(&router).await?)
    }

    pub async fn balancer_start(&self, cluster: &ShardedClusterHandle) -> Result<()> {
        let router = self.ready_router(cluster).await?;
        self.admin.run(&router, &AdminCommand::BalancerStart).await?;
        tracing::info!(cluster = %cluster.name(), "balancer started");
        Ok(())
    }

    pub async fn balancer_stop(&self, cluster: &ShardedClusterHandle) -> Result<()> {
        let router = self.ready_router(cluster).await?;
        self.admin.run(&router, &AdminCommand::BalancerStop).await?;
        tracing::info!(cluster = %cluster.name(), "balancer stopped");
        Ok(())
    }

    pub async fn balancer_status(&self, cluster: &ShardedClusterHandle) -> Result<BalancerStatus> {
        let router = self.ready_router(cluster).await?;
        Ok(self.admin.balancer_status(&router).await?)
    }

    /// Wait for the balancer to finish a round that started after this call.
    pub async fn await_balancer_round(
        &self,
        cluster: &ShardedClusterHandle,
        timeout: Duration,
    ) -> Result<BalancerStatus> {
        let router = self.ready_router(cluster).await?;
        let start = self.admin.balancer_status(&router).await?;
        // A round already in flight may have started before the caller's change.
        let target = start.num_balancer_rounds + if start.in_balancer_round { 2 } else { 1 };

        let (admin, router) = (&self.admin, &router);
        let what = format!("a balancer round in {}", cluster.name());
        let status = wait_until(what, timeout, move || async move {
            let status = admin.balancer_status(router).await?;
            Ok::<_, AdminError>(if status.num_balancer_rounds >= target {
                Check::Ready(status)
            } else {
                Check::pending(format!(
                    "{} rounds, mode {}",
                    status.num_balancer_rounds, status.mode
                ))
            })
        })
        .await?;
        Ok(status)
    }

    /// The first router that answers `ping`, waiting if none does yet.
    async fn ready_router(&self, cluster: &ShardedClusterHandle) -> Result<HostAddr> {
        cluster.ensure_live()?;
        let (admin, routers) = (&self.admin, cluster.routers());
        let what = format!("a router of {}", cluster.name());
        let addr = wait_until(what, env::default_timeout(), move || async move {
            let mut last = String::from("no routers");
            for router in routers {
                match admin.ping(router.addr()).await {
                    Ok(()) => return Ok::<_, AdminError>(Check::Ready(router.addr().clone())),
                    Err(e) => last = e.to_string(),
                }
            }
            Ok(Check::Pending(last))
        })
        .await?;
        Ok(addr)
    }

    async fn owner_of(&self, router: &HostAddr, ns: &str, key: i64) -> Result<ChunkInfo> {
        let chunks = self.admin.list_chunks(router, ns).await?;
        chunks.into_iter().find(|c| c.contains(key)).ok_or_else(|| {
            HarnessError::Admin(AdminError::Command {
                addr: router.clone(),
                command: "listChunks".into(),
                code: crate::admin::protocol::codes::NAMESPACE_NOT_FOUND,
                code_name: "NamespaceNotFound".into(),
                message: format!("no chunk of {ns} holds {key}"),
            })
        })
    }

    async fn await_shard_primary(
        &self,
        cluster: &mut ShardedClusterHandle,
        shard: &str,
    ) -> Result<()> {
        let set = cluster.shard_mut(shard)?;
        self.replsets.get_primary(set, env::default_timeout()).await?;
        Ok(())
    }
}
