//! Router operations with the safety checks the cluster does not enforce itself.

use std::collections::BTreeSet;

use crate::error::{CoordError, Result, FORBIDDEN_REMOVAL_ERR_CODE};
use crate::session::{AdminSession, SessionFactory, SessionTarget};
use crate::topology::{ClusterMembership, DrainState, RemovalInfo, ShardIdentity};

/// A scoped router session. Dropping it closes the connection.
pub struct Router {
    session: Box<dyn AdminSession>,
}

impl Router {
    pub fn new(session: Box<dyn AdminSession>) -> Self {
        Self { session }
    }

    pub async fn open(factory: &dyn SessionFactory, hosts: &BTreeSet<String>) -> Result<Self> {
        let target = SessionTarget::Router {
            hosts: hosts.clone(),
        };
        Ok(Self::new(factory.connect(&target).await?))
    }

    /// Shard names currently registered with the router.
    pub async fn shard_members(&self) -> Result<BTreeSet<String>> {
        Ok(self.session.list_shards().await?.names())
    }

    /// Adds a shard unless a shard of that name is already registered.
    ///
    /// Returns whether an add command was issued.
    pub async fn add_shard(&self, shard: &ShardIdentity) -> Result<bool> {
        if self.shard_members().await?.contains(&shard.name) {
            tracing::info!("Skipping adding shard {}, shard is already in cluster", shard.name);
            return Ok(false);
        }

        tracing::info!("Adding shard {}", shard.name);
        self.session.add_shard(&shard.host_spec()).await?;
        Ok(true)
    }

    /// Issues one remove command for `shard_name`.
    ///
    /// Refuses while another shard is draining or when the target is a primary
    /// shard. A shard already draining may be removed again; the router needs
    /// several remove calls before a shard is gone.
    pub async fn remove_shard(&self, shard_name: &str) -> Result<RemovalInfo> {
        let shards = self.session.list_shards().await?;
        if shards.any_draining_except(shard_name) {
            let msg = format!(
                "cannot remove shard {} from cluster, another shard is draining",
                shard_name
            );
            tracing::error!("{}", msg);
            return Err(CoordError::NotReady(msg));
        }

        let databases = self.session.list_databases().await?;
        let membership = ClusterMembership::from_router(&shards, &databases);
        if membership.is_primary_shard(shard_name) {
            let msg = format!("Shard {} is the primary shard, cannot remove.", shard_name);
            tracing::error!("{}", msg);
            return Err(CoordError::RemovePrimaryShard(msg));
        }

        tracing::info!("Attempting to remove shard {}", shard_name);
        let info = match self.session.remove_shard(shard_name).await {
            Ok(info) => info,
            Err(e) if e.code() == Some(FORBIDDEN_REMOVAL_ERR_CODE) => {
                tracing::error!(
                    "Cannot remove the last shard from cluster, this is forbidden by the router."
                );
                return Err(CoordError::RemoveLastShard(shard_name.to_string()));
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            "Shard {} draining status is: {}. Remaining chunks: {}. DBs to move: {}.",
            shard_name,
            info.state,
            info.remaining_display(),
            info.dbs_display()
        );
        Ok(info)
    }

    /// Draining flag of `shard_name`, or `None` when the shard is no longer listed.
    pub async fn drain_state(&self, shard_name: &str) -> Result<Option<DrainState>> {
        let shards = self.session.list_shards().await?;
        Ok(shards.get(shard_name).map(|s| DrainState {
            name: s.id.clone(),
            draining: s.draining,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;

    #[tokio::test]
    async fn test_add_shard_is_idempotent() {
        let cluster = SimCluster::sharded(&["s1"]);
        let router = Router::new(cluster.router_session());
        let shard = ShardIdentity::new("s1", vec!["10.0.0.1".to_string()], 27018);
        assert!(!router.add_shard(&shard).await.unwrap());
        assert_eq!(cluster.command_count("addShard"), 0);
    }

    #[tokio::test]
    async fn test_remove_translates_forbidden_code() {
        let cluster = SimCluster::sharded(&["s1"]);
        let router = Router::new(cluster.router_session());
        let err = router.remove_shard("s1").await.unwrap_err();
        assert!(matches!(err, CoordError::RemoveLastShard(_)));
    }

    #[tokio::test]
    async fn test_drain_state_absent_shard() {
        let cluster = SimCluster::sharded(&["s1", "s2"]);
        let router = Router::new(cluster.router_session());
        assert!(router.drain_state("s9").await.unwrap().is_none());
        let state = router.drain_state("s1").await.unwrap().unwrap();
        assert_eq!(state.draining, None);
    }
}
