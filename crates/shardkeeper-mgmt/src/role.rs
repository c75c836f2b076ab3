//! Deployment roles and write authority.
//!
//! Role-specific components take the payload of their variant
//! ([`ConfigServerRole`], [`ShardRole`]) in their constructors, so shard-only
//! logic cannot be built for a config-server and vice versa.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Role name as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Replication,
    ConfigServer,
    Shard,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Replication => write!(f, "replication"),
            Role::ConfigServer => write!(f, "config-server"),
            Role::Shard => write!(f, "shard"),
        }
    }
}

/// Config-server payload: where its router listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigServerRole {
    pub router_hosts: BTreeSet<String>,
    pub shard_port: u16,
}

/// Shard payload: the name it is registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRole {
    pub shard_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRole {
    Replication,
    ConfigServer(ConfigServerRole),
    Shard(ShardRole),
}

impl ClusterRole {
    pub fn role(&self) -> Role {
        match self {
            ClusterRole::Replication => Role::Replication,
            ClusterRole::ConfigServer(_) => Role::ConfigServer,
            ClusterRole::Shard(_) => Role::Shard,
        }
    }

    pub fn as_config_server(&self) -> Option<&ConfigServerRole> {
        match self {
            ClusterRole::ConfigServer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_shard(&self) -> Option<&ShardRole> {
        match self {
            ClusterRole::Shard(s) => Some(s),
            _ => None,
        }
    }

    /// Shards cannot start an upgrade campaign; it is driven from the config-server.
    pub fn may_initiate_upgrade(&self) -> bool {
        !matches!(self, ClusterRole::Shard(_))
    }
}

/// Whether this unit holds the cluster-wide write token.
///
/// Only the leader writes shared state or issues mutating cluster commands.
/// Followers get a no-op result from mutating operations, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authority {
    Leader,
    Follower,
}

impl Authority {
    pub fn from_leadership(is_leader: bool) -> Self {
        if is_leader {
            Authority::Leader
        } else {
            Authority::Follower
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Authority::Leader)
    }
}

/// Result of a mutating call. Followers get `Unauthorized` and nothing happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T> {
    Applied(T),
    Unauthorized,
}

impl<T> Mutation<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Mutation::Applied(v) => Some(v),
            Mutation::Unauthorized => None,
        }
    }
}
