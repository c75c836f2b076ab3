//! Common fixtures for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use shardkeeper_mgmt::peer::InMemoryPeerStore;
use shardkeeper_mgmt::retry::RecordingSleeper;
use shardkeeper_mgmt::sim::SimCluster;
use shardkeeper_mgmt::status::StatusReporter;
use shardkeeper_mgmt::topology::{ClusterMember, ShardRelation};
use shardkeeper_mgmt::upgrade::{Collaborators, UpgradeCoordinator, UpgradeSettings};
use shardkeeper_mgmt::{Authority, ClusterRole, ConfigServerRole};

pub const TARGET_VERSION: &str = "7.0.5";

pub fn config_server() -> ConfigServerRole {
    ConfigServerRole {
        router_hosts: ["10.0.9.1".to_string()].into(),
        shard_port: 27018,
    }
}

/// A relation whose units all published an address.
pub fn relation(id: u32, name: &str) -> ShardRelation {
    ShardRelation {
        id,
        app_name: name.to_string(),
        unit_addresses: vec![Some(format!("10.0.{}.1", id)), Some(format!("10.0.{}.2", id))],
    }
}

/// A relation whose units have not published addresses yet.
pub fn hostless_relation(id: u32, name: &str) -> ShardRelation {
    ShardRelation {
        id,
        app_name: name.to_string(),
        unit_addresses: vec![None],
    }
}

pub fn member_hosts(n: u32) -> Vec<String> {
    (0..n).map(|i| format!("10.0.0.{}", i + 1)).collect()
}

pub fn members(n: u32) -> Vec<ClusterMember> {
    member_hosts(n)
        .into_iter()
        .enumerate()
        .map(|(i, host)| ClusterMember::new(i as u32, host))
        .collect()
}

/// A replica set of `n` members, member 0 primary, plus everything an
/// upgrade coordinator needs.
pub struct UpgradeHarness {
    pub cluster: SimCluster,
    pub peers: InMemoryPeerStore,
    pub status: StatusReporter,
    pub sleeper: RecordingSleeper,
    pub role: ClusterRole,
    pub members: Vec<ClusterMember>,
}

impl UpgradeHarness {
    pub fn new(n: u32) -> Self {
        let hosts = member_hosts(n);
        let refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        Self {
            cluster: SimCluster::replica_set(&refs),
            peers: InMemoryPeerStore::new(),
            status: StatusReporter::default(),
            sleeper: RecordingSleeper::new(),
            role: ClusterRole::Replication,
            members: members(n),
        }
    }

    pub fn settings() -> UpgradeSettings {
        UpgradeSettings {
            target_version: TARGET_VERSION.to_string(),
            ..Default::default()
        }
    }

    pub fn coordinator(&self, authority: Authority) -> UpgradeCoordinator<'_> {
        let deps = Collaborators {
            factory: &self.cluster,
            services: &self.cluster,
            peers: &self.peers,
            status: &self.status,
        };
        UpgradeCoordinator::new(&self.role, self.members.clone(), deps, authority, Self::settings())
            .with_sleeper(&self.sleeper)
    }

    pub fn total_wait(&self) -> Duration {
        self.sleeper.waits().iter().sum()
    }
}
