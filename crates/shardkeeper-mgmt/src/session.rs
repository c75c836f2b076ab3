//! Administrative session contract.
//!
//! The coordinator never speaks the database wire protocol itself. It talks to
//! the router and to individual replica members through [`AdminSession`], and
//! obtains sessions from a [`SessionFactory`]. A session is scoped: acquire it
//! for one operation and let it drop. Implementations close the underlying
//! connection in `Drop`, so no connection outlives the pass that opened it.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::topology::{DatabaseInfo, RemovalInfo, ReplicaSetStatus, ShardList};

/// Where a session should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// The local deployment's own replica set, routed to its primary.
    Local,
    /// A router reachable through any of the given hosts.
    Router {
        /// Router hosts, without ports.
        hosts: BTreeSet<String>,
    },
    /// A single member, bypassing replica-set discovery.
    Direct {
        /// Member host, without port.
        host: String,
    },
}

impl SessionTarget {
    pub fn router<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SessionTarget::Router {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn direct(host: impl Into<String>) -> Self {
        SessionTarget::Direct { host: host.into() }
    }
}

/// Narrow command surface of the cluster.
///
/// Every method maps to a single administrative command. Failures are reported
/// as [`crate::error::CoordError::AdminCommand`] carrying the server error code
/// when there is one.
#[async_trait]
pub trait AdminSession: Send + Sync {
    /// `listShards` on a router.
    async fn list_shards(&self) -> Result<ShardList>;

    /// `addShard` on a router. `host_spec` is `name/host:port,...`.
    async fn add_shard(&self, host_spec: &str) -> Result<()>;

    /// `removeShard` on a router. Must be repeated until the shard is gone.
    async fn remove_shard(&self, shard_name: &str) -> Result<RemovalInfo>;

    /// Database catalogue as kept by the router, including each database's primary shard.
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>>;

    /// `replSetGetStatus` on a replica member.
    async fn replica_set_status(&self) -> Result<ReplicaSetStatus>;

    /// Forces the current primary to step down.
    async fn step_down_primary(&self) -> Result<()>;

    /// Host of the current primary, if any.
    async fn current_primary(&self) -> Result<Option<String>>;

    /// Changes a database user's password.
    async fn set_user_password(&self, username: &str, password: &str) -> Result<()>;

    /// Inserts `{write_value: value}` into `admin.<collection>`.
    async fn insert_marker(&self, collection: &str, value: &str) -> Result<()>;

    /// Reads the first marker of `admin.<collection>`, if present.
    async fn find_marker(&self, collection: &str) -> Result<Option<String>>;

    /// Drops `admin.<collection>`. Dropping a missing collection succeeds.
    async fn drop_collection(&self, collection: &str) -> Result<()>;
}

/// Opens scoped sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn AdminSession>>;
}
