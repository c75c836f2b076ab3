//! A shard's life from both sides: credentials in, draining out.

mod common;

use common::{config_server, member_hosts, relation};
use shardkeeper_mgmt::credentials::{CredentialPublisher, CredentialSync};
use shardkeeper_mgmt::gate::{GateDecision, HookContext};
use shardkeeper_mgmt::peer::{decode_hosts, keys, InMemoryPeerStore, InMemoryRelationData, PeerData};
use shardkeeper_mgmt::probe::ReadWriteProbe;
use shardkeeper_mgmt::retry::RecordingSleeper;
use shardkeeper_mgmt::service::ServiceControl;
use shardkeeper_mgmt::sim::SimCluster;
use shardkeeper_mgmt::status::StatusReporter;
use shardkeeper_mgmt::topology::ClusterMember;
use shardkeeper_mgmt::{
    Authority, ClusterRole, CoordError, CoordinatorConfig, DrainOutcome, DrainWatcher, PassVerdict, Role,
    ShardRole, ShardSetReconciler,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn shard_ctx(authority: Authority) -> HookContext {
    HookContext {
        role: Role::Shard,
        authority,
        db_initialised: true,
        backup_in_progress: false,
    }
}

#[tokio::test]
async fn test_shard_observes_its_own_removal() {
    let cluster = SimCluster::sharded(&["s1", "s2"])
        .with_database("orders", "s1")
        .with_removal_rounds(2);
    let cs_role = config_server();
    let cs_status = StatusReporter::default();
    let reconciler = ShardSetReconciler::new(&cs_role, &cluster, &cs_status, Authority::Leader);

    let shard = ShardRole {
        shard_name: "s2".to_string(),
    };
    let peers = InMemoryPeerStore::new();
    let shard_status = StatusReporter::default();
    let watcher = DrainWatcher::new(&shard, &cluster, &peers, &shard_status, Authority::Leader);

    // s2 is still wanted, so nobody has asked for it to leave.
    let relations = vec![relation(1, "s1"), relation(2, "s2")];
    assert!(matches!(
        reconciler.reconcile(&relations, None).await,
        PassVerdict::Done(_)
    ));
    let err = watcher.is_drained(&cs_role.router_hosts).await.unwrap_err();
    assert!(matches!(err, CoordError::ShardNotPlannedForRemoval(_)));

    // The s2 relation departs.
    assert!(matches!(
        reconciler.reconcile(&relations, Some(2)).await,
        PassVerdict::Retry(_)
    ));
    assert!(!watcher.is_drained(&cs_role.router_hosts).await.unwrap());

    assert!(matches!(
        reconciler.reconcile(&relations, Some(2)).await,
        PassVerdict::Done(_)
    ));
    assert!(watcher.is_drained(&cs_role.router_hosts).await.unwrap());

    // Followers of the shard see the leader's verdict.
    let follower = DrainWatcher::new(&shard, &cluster, &peers, &shard_status, Authority::Follower);
    assert!(follower.is_drained(&cs_role.router_hosts).await.unwrap());
}

#[tokio::test]
async fn test_wait_until_drained_while_config_server_removes() {
    let cluster = SimCluster::sharded(&["s1", "s2"]).with_removal_rounds(3);
    let cs_role = config_server();
    let cs_status = StatusReporter::default();
    let reconciler = ShardSetReconciler::new(&cs_role, &cluster, &cs_status, Authority::Leader);

    let shard = ShardRole {
        shard_name: "s2".to_string(),
    };
    let peers = InMemoryPeerStore::new();
    let shard_status = StatusReporter::default();
    let sleeper = RecordingSleeper::new();
    let poll_interval = CoordinatorConfig {
        drain_poll_interval_secs: 2,
        ..Default::default()
    }
    .drain_poll_interval();
    let watcher = DrainWatcher::new(&shard, &cluster, &peers, &shard_status, Authority::Leader)
        .with_sleeper(&sleeper)
        .with_poll_interval(poll_interval);

    let relations = vec![relation(1, "s1")];
    assert!(matches!(
        reconciler.reconcile(&relations, None).await,
        PassVerdict::Retry(_)
    ));

    let cancel = CancellationToken::new();
    let waiting = watcher.wait_until_drained(&cs_role.router_hosts, &cancel);
    let passes = async {
        let mut verdicts = Vec::new();
        for polls in [2, 4] {
            while sleeper.count() < polls {
                tokio::task::yield_now().await;
            }
            verdicts.push(reconciler.reconcile(&relations, None).await);
        }
        verdicts
    };
    let (outcome, verdicts) = tokio::join!(waiting, passes);

    assert_eq!(outcome.unwrap(), DrainOutcome::Drained);
    assert!(matches!(verdicts[0], PassVerdict::Retry(_)));
    assert!(matches!(verdicts[1], PassVerdict::Done(_)));
    assert!(sleeper.count() >= 4);
    assert!(sleeper.waits().iter().all(|w| *w == Duration::from_secs(2)));
    assert!(shard_status.current().is_active());
    assert!(PeerData::new(&peers).drained().await.unwrap());
}

#[tokio::test]
async fn test_credentials_reach_the_shard() {
    let cs_role = config_server();
    let cs_peers = InMemoryPeerStore::new();
    let cs_data = PeerData::new(&cs_peers);
    cs_data.set_secret(keys::OPERATOR_PASSWORD, "op-secret").await.unwrap();
    cs_data.set_secret(keys::KEYFILE, "keyfile-contents").await.unwrap();
    let relations = InMemoryRelationData::with_relations([7]);
    let publisher = CredentialPublisher::new(&cs_role, &relations, &cs_peers, Authority::Leader);
    publisher.publish_to(7).await.unwrap();

    let bag = relations.bag(7).await;
    assert_eq!(decode_hosts(&bag[keys::HOSTS]).unwrap(), cs_role.router_hosts);

    let shard_cluster = SimCluster::replica_set(&["10.0.7.1", "10.0.7.2"]);
    let shard = ShardRole {
        shard_name: "s7".to_string(),
    };
    let shard_peers = InMemoryPeerStore::new();
    let status = StatusReporter::default();
    let leader_unit = ClusterMember::new(0, "10.0.7.1");
    let follower_unit = ClusterMember::new(1, "10.0.7.2");

    let leader = CredentialSync::new(
        &shard,
        &leader_unit,
        &shard_cluster,
        &shard_cluster,
        &shard_peers,
        &status,
        Authority::Leader,
        "operator",
    );
    let decision = leader
        .on_config_server_data(&shard_ctx(Authority::Leader), &bag)
        .await
        .unwrap();
    assert_eq!(decision, GateDecision::Proceed);
    assert_eq!(shard_cluster.password("operator").as_deref(), Some("op-secret"));

    let follower = CredentialSync::new(
        &shard,
        &follower_unit,
        &shard_cluster,
        &shard_cluster,
        &shard_peers,
        &status,
        Authority::Follower,
        "operator",
    );
    follower
        .on_config_server_data(&shard_ctx(Authority::Follower), &bag)
        .await
        .unwrap();

    for host in ["10.0.7.1", "10.0.7.2"] {
        assert_eq!(shard_cluster.keyfile_of(host).as_deref(), Some("keyfile-contents"));
    }
    // One password change, made by the leader.
    assert_eq!(shard_cluster.command_count("updateUser"), 1);

    // Delivering the same data again changes nothing.
    leader
        .on_config_server_data(&shard_ctx(Authority::Leader), &bag)
        .await
        .unwrap();
    assert_eq!(shard_cluster.command_count("updateUser"), 1);
    assert_eq!(
        shard_cluster
            .service_actions()
            .iter()
            .filter(|a| a.starts_with("restart"))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_replication_role_cannot_take_shard_credentials() {
    let cluster = SimCluster::replica_set(&["10.0.7.1"]);
    let shard = ShardRole {
        shard_name: "s7".to_string(),
    };
    let peers = InMemoryPeerStore::new();
    let status = StatusReporter::default();
    let unit = ClusterMember::new(0, "10.0.7.1");
    let sync = CredentialSync::new(
        &shard,
        &unit,
        &cluster,
        &cluster,
        &peers,
        &status,
        Authority::Leader,
        "operator",
    );
    let ctx = HookContext {
        role: Role::Replication,
        ..shard_ctx(Authority::Leader)
    };

    let decision = sync
        .on_config_server_data(&ctx, &Default::default())
        .await
        .unwrap();
    assert!(matches!(decision, GateDecision::Blocked(_)));
    assert!(status.current().needs_operator());
    assert!(cluster.service_actions().is_empty());
}

fn hosts(n: u32) -> BTreeSet<String> {
    member_hosts(n).into_iter().collect()
}

#[tokio::test]
async fn test_probe_leaves_no_collection_behind() {
    let cluster = SimCluster::replica_set(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let probe = ReadWriteProbe::new(&cluster, 16);

    assert!(probe.is_replica_set_read_write_healthy(&hosts(3)).await.unwrap());
    cluster.set_lagging("10.0.0.2", true);
    assert!(!probe.is_replica_set_read_write_healthy(&hosts(3)).await.unwrap());

    assert_eq!(cluster.command_count("drop"), 2);
    for host in member_hosts(3) {
        assert!(cluster.collections_on(&host).is_empty());
    }
    assert_eq!(cluster.open_sessions(), 0);
}

#[tokio::test]
async fn test_probe_treats_unreachable_secondary_as_miss() {
    let cluster = SimCluster::replica_set(&["10.0.0.1", "10.0.0.2"]);
    cluster
        .stop(&ClusterMember::new(1, "10.0.0.2"))
        .await
        .unwrap();
    let probe = ReadWriteProbe::new(&cluster, 8);

    assert!(!probe.is_replica_set_read_write_healthy(&hosts(2)).await.unwrap());
    assert_eq!(cluster.command_count("drop"), 1);
}

#[tokio::test]
async fn test_probe_errors_still_clean_up() {
    let cluster = SimCluster::replica_set(&["10.0.0.1", "10.0.0.2"]);
    cluster.fail_next("isMaster", None, "connection reset");
    let probe = ReadWriteProbe::new(&cluster, 8);

    assert!(probe.is_replica_set_read_write_healthy(&hosts(2)).await.is_err());
    assert_eq!(cluster.command_count("drop"), 1);
    for host in member_hosts(2) {
        assert!(cluster.collections_on(&host).is_empty());
    }

    cluster.fail_next("drop", None, "not authorized");
    let err = probe
        .is_replica_set_read_write_healthy(&hosts(2))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::AdminCommand { .. }));
}

#[tokio::test]
async fn test_probe_by_role() {
    let cluster = SimCluster::replica_set(&["10.0.0.1"]);
    let probe = ReadWriteProbe::new(&cluster, 8);
    let shard = ClusterRole::Shard(ShardRole {
        shard_name: "s1".to_string(),
    });

    assert!(!probe.check(&shard, &hosts(1)).await.unwrap());
    assert!(!probe
        .check(&ClusterRole::ConfigServer(config_server()), &hosts(1))
        .await
        .unwrap());
    assert!(cluster.commands().is_empty());
    assert!(probe.check(&ClusterRole::Replication, &hosts(1)).await.unwrap());
}
