//! Config-server reconciliation of the router's shard list against the
//! shards related to it.
//!
//! A pass adds every related shard the router does not know and removes every
//! registered shard that is no longer related. Shards are compared by name
//! only. Removal takes several passes: the router keeps a removed shard
//! listed until its data has moved, and each pass re-issues the command.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoordError, ErrorClass, Result};
use crate::gate::{membership_change_gate, GateDecision, HookContext};
use crate::role::{Authority, ConfigServerRole, Mutation};
use crate::router::Router;
use crate::session::SessionFactory;
use crate::status::{StatusReporter, UnitStatus};
use crate::topology::{desired_shards, RelationId, ShardIdentity, ShardRelation};

/// Shards touched by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Desired shards whose units have not published addresses yet.
    pub skipped_not_ready: Vec<String>,
}

impl ShardChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.skipped_not_ready.is_empty()
    }

    fn merge(&mut self, other: ShardChanges) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.skipped_not_ready.extend(other.skipped_not_ready);
    }
}

/// Difference between desired and live shard membership, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlan {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
    /// Missing shards that cannot be added until their hosts are known.
    pub not_ready: Vec<String>,
}

pub fn plan_shards(desired: &BTreeMap<String, ShardIdentity>, live: &BTreeSet<String>) -> ShardPlan {
    let mut plan = ShardPlan::default();
    for (name, shard) in desired.iter().filter(|(name, _)| !live.contains(*name)) {
        if shard.is_ready() {
            plan.to_add.push(name.clone());
        } else {
            plan.not_ready.push(name.clone());
        }
    }
    plan.to_remove = live
        .iter()
        .filter(|name| !desired.contains_key(*name))
        .cloned()
        .collect();
    plan
}

/// What the dispatcher should do after a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassVerdict {
    Done(ShardChanges),
    /// Nothing to do on this unit.
    Skipped(String),
    /// Run the pass again later.
    Retry(String),
    /// Needs an operator; running again will not help.
    Blocked(String),
}

impl PassVerdict {
    fn from_error(err: &CoordError) -> Self {
        match err.class() {
            ErrorClass::Retryable | ErrorClass::Inconsistent => PassVerdict::Retry(err.to_string()),
            ErrorClass::SafetyViolation | ErrorClass::Fatal => PassVerdict::Blocked(err.to_string()),
        }
    }
}

pub struct ShardSetReconciler<'a> {
    config_server: &'a ConfigServerRole,
    factory: &'a dyn SessionFactory,
    status: &'a StatusReporter,
    authority: Authority,
}

impl<'a> ShardSetReconciler<'a> {
    pub fn new(
        config_server: &'a ConfigServerRole,
        factory: &'a dyn SessionFactory,
        status: &'a StatusReporter,
        authority: Authority,
    ) -> Self {
        Self {
            config_server,
            factory,
            status,
            authority,
        }
    }

    async fn router(&self) -> Result<Router> {
        Router::open(self.factory, &self.config_server.router_hosts).await
    }

    /// Adds every desired shard the router does not list yet.
    ///
    /// Shards without hosts are skipped; an add failure stops the pass.
    pub async fn add_missing_shards(
        &self,
        desired: &BTreeMap<String, ShardIdentity>,
    ) -> Result<Mutation<ShardChanges>> {
        if !self.authority.is_leader() {
            tracing::debug!("Not the leader, not adding shards");
            return Ok(Mutation::Unauthorized);
        }

        let router = self.router().await?;
        let plan = plan_shards(desired, &router.shard_members().await?);
        let mut changes = ShardChanges::default();

        for name in plan.not_ready {
            tracing::info!("host info for shard {} not yet added, skipping", name);
            changes.skipped_not_ready.push(name);
        }

        for (name, shard) in plan.to_add.iter().filter_map(|n| desired.get_key_value(n)) {
            self.status.set(UnitStatus::Maintenance(format!(
                "Adding shard {} to config-server",
                name
            )));
            if let Err(e) = router.add_shard(shard).await {
                tracing::error!("Failed to add shard {} to the config server, error={}", name, e);
                return Err(e);
            }
            changes.added.push(name.clone());
        }

        self.status.set(UnitStatus::active());
        Ok(Mutation::Applied(changes))
    }

    /// Issues a remove command for every listed shard that is not desired.
    ///
    /// Returns [`CoordError::NotDrained`] while a removed shard is still listed.
    pub async fn remove_extra_shards(
        &self,
        desired: &BTreeMap<String, ShardIdentity>,
    ) -> Result<Mutation<ShardChanges>> {
        if !self.authority.is_leader() {
            tracing::debug!("Not the leader, not removing shards");
            return Ok(Mutation::Unauthorized);
        }

        let router = self.router().await?;
        let plan = plan_shards(desired, &router.shard_members().await?);
        let mut changes = ShardChanges::default();

        for name in &plan.to_remove {
            self.status
                .set(UnitStatus::Maintenance(format!("Draining shard {}", name)));
            router.remove_shard(name).await?;
            tracing::info!("Shard: {}, is now draining", name);

            if router.shard_members().await?.contains(name) {
                let msg = format!(
                    "shard {} still exists in cluster after removal, it is still draining.",
                    name
                );
                tracing::info!("{}", msg);
                return Err(CoordError::NotDrained(msg));
            }
            changes.removed.push(name.clone());
        }

        Ok(Mutation::Applied(changes))
    }

    pub async fn add_shards(
        &self,
        relations: &[ShardRelation],
        excluding: Option<RelationId>,
    ) -> Result<Mutation<ShardChanges>> {
        let desired = desired_shards(relations, excluding, self.config_server.shard_port);
        self.add_missing_shards(&desired).await
    }

    pub async fn remove_shards(
        &self,
        relations: &[ShardRelation],
        excluding: Option<RelationId>,
    ) -> Result<Mutation<ShardChanges>> {
        let desired = desired_shards(relations, excluding, self.config_server.shard_port);
        self.remove_extra_shards(&desired).await
    }

    /// One full pass: add, then remove. `excluding` is a relation being torn down.
    pub async fn reconcile(
        &self,
        relations: &[ShardRelation],
        excluding: Option<RelationId>,
    ) -> PassVerdict {
        if !self.authority.is_leader() {
            return PassVerdict::Skipped("not the leader".to_string());
        }

        tracing::info!("Adding shards not present in cluster.");
        let mut changes = ShardChanges::default();
        let result = async {
            if let Mutation::Applied(added) = self.add_shards(relations, excluding).await? {
                changes.merge(added);
            }
            if let Mutation::Applied(removed) = self.remove_shards(relations, excluding).await? {
                changes.merge(removed);
            }
            Ok::<(), CoordError>(())
        }
        .await;

        match result {
            Ok(()) => PassVerdict::Done(changes),
            Err(CoordError::NotDrained(msg)) => {
                tracing::info!(
                    "Shard is still present in the cluster after removal, will remove again later."
                );
                PassVerdict::Retry(msg)
            }
            Err(e) => {
                let verdict = PassVerdict::from_error(&e);
                if let PassVerdict::Blocked(msg) = &verdict {
                    tracing::error!("Shard reconciliation blocked: {}", msg);
                    self.status.set(UnitStatus::Blocked(msg.clone()));
                } else {
                    tracing::error!("Retrying shard reconciliation later, error={}", e);
                }
                verdict
            }
        }
    }

    /// Gates the pass on role, leadership, initialisation and backups first.
    pub async fn handle_event(
        &self,
        ctx: &HookContext,
        relations: &[ShardRelation],
        excluding: Option<RelationId>,
    ) -> PassVerdict {
        match membership_change_gate(ctx) {
            GateDecision::Proceed => self.reconcile(relations, excluding).await,
            GateDecision::Skip(reason) => {
                tracing::info!("Skipping relation event: {}", reason);
                PassVerdict::Skipped(reason)
            }
            GateDecision::Defer(reason) => PassVerdict::Retry(reason),
            GateDecision::Blocked(reason) => {
                self.status.set(UnitStatus::Blocked(reason.clone()));
                PassVerdict::Blocked(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;
    use crate::sim::SimCluster;

    fn config_server() -> ConfigServerRole {
        ConfigServerRole {
            router_hosts: ["10.0.9.1".to_string()].into(),
            shard_port: 27018,
        }
    }

    fn relation(id: RelationId, name: &str, hosts: &[&str]) -> ShardRelation {
        ShardRelation {
            id,
            app_name: name.to_string(),
            unit_addresses: hosts.iter().map(|h| Some(h.to_string())).collect(),
        }
    }

    #[test]
    fn test_plan_shards_diffs_by_name() {
        let relations = vec![
            relation(1, "s1", &["10.0.1.1"]),
            relation(2, "s2", &["10.0.2.1"]),
            relation(3, "s3", &[]),
        ];
        let desired = desired_shards(&relations, None, 27018);
        let live: BTreeSet<String> = ["s1".to_string(), "s4".to_string()].into();
        let plan = plan_shards(&desired, &live);
        assert_eq!(plan.to_add, vec!["s2".to_string()]);
        assert_eq!(plan.not_ready, vec!["s3".to_string()]);
        assert_eq!(plan.to_remove, vec!["s4".to_string()]);
    }

    #[tokio::test]
    async fn test_adds_missing_shard_and_skips_hostless() {
        let cluster = SimCluster::sharded(&["s1"]);
        let status = StatusReporter::default();
        let role = config_server();
        let reconciler = ShardSetReconciler::new(&role, &cluster, &status, Authority::Leader);
        let relations = vec![
            relation(1, "s1", &["10.0.1.1"]),
            relation(2, "s2", &["10.0.2.1"]),
            relation(3, "s3", &[]),
        ];

        let changes = reconciler
            .add_shards(&relations, None)
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(changes.added, vec!["s2".to_string()]);
        assert_eq!(changes.skipped_not_ready, vec!["s3".to_string()]);
        assert_eq!(cluster.command_count("addShard"), 1);
        assert!(status.current().is_active());
    }

    #[tokio::test]
    async fn test_follower_is_unauthorized() {
        let cluster = SimCluster::sharded(&["s1"]);
        let status = StatusReporter::default();
        let role = config_server();
        let reconciler = ShardSetReconciler::new(&role, &cluster, &status, Authority::Follower);
        let relations = vec![relation(2, "s2", &["10.0.2.1"])];
        assert_eq!(
            reconciler.add_shards(&relations, None).await.unwrap(),
            Mutation::Unauthorized
        );
        assert_eq!(
            reconciler.reconcile(&relations, None).await,
            PassVerdict::Skipped("not the leader".into())
        );
        assert!(cluster.commands().is_empty());
    }

    #[tokio::test]
    async fn test_removal_requires_repeated_passes() {
        let cluster = SimCluster::sharded(&["s1", "s2"]).with_removal_rounds(2);
        let status = StatusReporter::default();
        let role = config_server();
        let reconciler = ShardSetReconciler::new(&role, &cluster, &status, Authority::Leader);
        let relations = vec![relation(1, "s1", &["10.0.1.1"]), relation(2, "s2", &["10.0.2.1"])];

        let first = reconciler.reconcile(&relations, Some(2)).await;
        assert!(matches!(first, PassVerdict::Retry(_)));
        assert_eq!(status.current(), UnitStatus::Maintenance("Draining shard s2".into()));

        let second = reconciler.reconcile(&relations, Some(2)).await;
        match second {
            PassVerdict::Done(changes) => assert_eq!(changes.removed, vec!["s2".to_string()]),
            other => panic!("unexpected verdict: {:?}", other),
        }
        assert_eq!(cluster.command_count("removeShard"), 2);
    }

    #[tokio::test]
    async fn test_primary_shard_blocks_pass() {
        let cluster = SimCluster::sharded(&["s1", "s2"]).with_database("orders", "s2");
        let status = StatusReporter::default();
        let role = config_server();
        let reconciler = ShardSetReconciler::new(&role, &cluster, &status, Authority::Leader);
        let relations = vec![relation(1, "s1", &["10.0.1.1"])];

        let err = reconciler.remove_shards(&relations, None).await.unwrap_err();
        assert!(matches!(err, CoordError::RemovePrimaryShard(_)));
        assert!(matches!(
            reconciler.reconcile(&relations, None).await,
            PassVerdict::Blocked(_)
        ));
        assert_eq!(cluster.command_count("removeShard"), 0);
        assert!(status.current().needs_operator());
    }

    #[tokio::test]
    async fn test_gate_defers_during_backup() {
        let cluster = SimCluster::sharded(&["s1"]);
        let status = StatusReporter::default();
        let role = config_server();
        let reconciler = ShardSetReconciler::new(&role, &cluster, &status, Authority::Leader);
        let ctx = HookContext {
            role: Role::ConfigServer,
            authority: Authority::Leader,
            db_initialised: true,
            backup_in_progress: true,
        };
        let verdict = reconciler.handle_event(&ctx, &[], None).await;
        assert_eq!(
            verdict,
            PassVerdict::Retry("Cannot add/remove shards while a backup/restore is in progress.".into())
        );
        assert!(cluster.commands().is_empty());
    }
}
