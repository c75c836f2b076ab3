//! Values derived from router and replica-set queries.
//!
//! Everything here is a snapshot owned by the caller for the duration of one
//! pass. Nothing is cached across invocations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Databases the router keeps for itself; never considered for primary-shard checks.
const INTERNAL_DATABASES: [&str; 3] = ["admin", "config", "local"];

/// A shard as the coordinator wants it to exist in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIdentity {
    pub name: String,
    pub hosts: BTreeSet<String>,
    pub port: u16,
}

impl ShardIdentity {
    pub fn new(name: impl Into<String>, hosts: impl IntoIterator<Item = String>, port: u16) -> Self {
        Self {
            name: name.into(),
            hosts: hosts.into_iter().collect(),
            port,
        }
    }

    /// A shard without hosts has not published its addresses yet.
    pub fn is_ready(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Connection string accepted by the add-shard command: `name/h1:port,h2:port`.
    pub fn host_spec(&self) -> String {
        let hosts: Vec<String> = self
            .hosts
            .iter()
            .map(|h| format!("{}:{}", h, self.port))
            .collect();
        format!("{}/{}", self.name, hosts.join(","))
    }
}

/// One entry of the router's shard list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: String,
    /// `replset/host:port,host:port` as reported by the router.
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draining: Option<bool>,
}

impl ShardEntry {
    /// Shard name carried in the host string, e.g. `shard03` for
    /// `shard03/host7:27018,host8:27018`.
    pub fn name_from_host(&self) -> &str {
        shard_name_from_host(&self.host)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.unwrap_or(false)
    }
}

/// Strips the host list from a router host string.
pub fn shard_name_from_host(host: &str) -> &str {
    host.split('/').next().unwrap_or(host)
}

/// Reply of the list-shards command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardList {
    pub shards: Vec<ShardEntry>,
}

impl ShardList {
    pub fn names(&self) -> BTreeSet<String> {
        self.shards
            .iter()
            .map(|s| s.name_from_host().to_string())
            .collect()
    }

    pub fn get(&self, shard_name: &str) -> Option<&ShardEntry> {
        self.shards.iter().find(|s| s.id == shard_name)
    }

    /// True when any shard except `ignore_shard` is draining.
    pub fn any_draining_except(&self, ignore_shard: &str) -> bool {
        self.shards
            .iter()
            .any(|s| s.id != ignore_shard && s.is_draining())
    }
}

/// Draining flag of a single shard. `None` means the shard was never marked for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainState {
    pub name: String,
    pub draining: Option<bool>,
}

/// A database as recorded in the router's catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    /// Shard holding the database's unsharded collections.
    pub primary: String,
    #[serde(default)]
    pub partitioned: bool,
}

/// The router's live membership view for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMembership {
    pub shards: BTreeSet<String>,
    pub primary_shards: BTreeSet<String>,
}

impl ClusterMembership {
    pub fn from_router(list: &ShardList, databases: &[DatabaseInfo]) -> Self {
        Self {
            shards: list.names(),
            primary_shards: primary_shards(databases),
        }
    }

    pub fn is_primary_shard(&self, shard_name: &str) -> bool {
        self.primary_shards.contains(shard_name)
    }
}

/// Shards that are primary for at least one user database.
pub fn primary_shards(databases: &[DatabaseInfo]) -> BTreeSet<String> {
    databases
        .iter()
        .filter(|db| !INTERNAL_DATABASES.contains(&db.name.as_str()))
        .map(|db| db.primary.clone())
        .collect()
}

/// Reply of the remove-shard command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalInfo {
    pub state: String,
    #[serde(default)]
    pub remaining_chunks: Option<u64>,
    #[serde(default)]
    pub dbs_to_move: Vec<String>,
}

impl RemovalInfo {
    pub fn remaining_display(&self) -> String {
        self.remaining_chunks
            .map(|c| c.to_string())
            .unwrap_or_else(|| "None".to_string())
    }

    pub fn dbs_display(&self) -> String {
        if self.dbs_to_move.is_empty() {
            "None".to_string()
        } else {
            self.dbs_to_move.join(",")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Primary,
    Secondary,
    Startup,
    Startup2,
    Recovering,
    Rollback,
    Arbiter,
    Down,
    Unknown,
}

impl MemberState {
    pub fn is_syncing(&self) -> bool {
        matches!(
            self,
            MemberState::Startup | MemberState::Startup2 | MemberState::Recovering | MemberState::Rollback
        )
    }
}

/// One replica-set member as reported by the replica-set status command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    /// `host:port`.
    pub name: String,
    pub state: MemberState,
    /// 1 when reachable from the answering member.
    pub health: u8,
}

impl MemberStatus {
    pub fn host(&self) -> &str {
        self.name.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.name)
    }

    pub fn is_reachable(&self) -> bool {
        self.health == 1 && self.state != MemberState::Down
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    pub members: Vec<MemberStatus>,
}

impl ReplicaSetStatus {
    /// Host of the current primary, if one is elected.
    pub fn primary_host(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.state == MemberState::Primary)
            .map(MemberStatus::host)
    }
}

/// A unit of the local replica set, as known from peer identity storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: u32,
    pub host: String,
}

impl ClusterMember {
    pub fn new(id: u32, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
        }
    }
}

/// Identifier of the relation a shard joined through.
pub type RelationId = u32;

/// A shard application related to the config-server, with its units' addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRelation {
    pub id: RelationId,
    /// Application name; doubles as the shard name.
    pub app_name: String,
    /// Private addresses of the units; `None` until a unit has published one.
    pub unit_addresses: Vec<Option<String>>,
}

/// Desired shard membership built from active relations, skipping a departing one.
pub fn desired_shards(
    relations: &[ShardRelation],
    excluding: Option<RelationId>,
    port: u16,
) -> BTreeMap<String, ShardIdentity> {
    relations
        .iter()
        .filter(|r| Some(r.id) != excluding)
        .map(|r| {
            let hosts = r.unit_addresses.iter().flatten().cloned();
            (r.app_name.clone(), ShardIdentity::new(r.app_name.clone(), hosts, port))
        })
        .collect()
}
