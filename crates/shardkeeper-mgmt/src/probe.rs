//! End-to-end read/write verification.
//!
//! A unique marker is written through the primary and read back from every
//! secondary over a direct connection. The marker collection is dropped on
//! every exit path.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::role::ClusterRole;
use crate::session::{SessionFactory, SessionTarget};

const COLLECTION_PREFIX: &str = "collection_";
const VALUE_PREFIX: &str = "unique_write_";

/// Random collection name and value for one probe. Never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRecord {
    pub collection_name: String,
    pub write_value: String,
}

impl ProbeRecord {
    pub fn random(token_len: usize) -> Self {
        Self {
            collection_name: format!("{}{}", COLLECTION_PREFIX, random_token(token_len)),
            write_value: format!("{}{}", VALUE_PREFIX, random_token(token_len)),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub struct ReadWriteProbe<'a> {
    factory: &'a dyn SessionFactory,
    token_len: usize,
}

impl<'a> ReadWriteProbe<'a> {
    pub fn new(factory: &'a dyn SessionFactory, token_len: usize) -> Self {
        Self { factory, token_len }
    }

    /// Runs the probe appropriate for `role` against the units at `hosts`.
    pub async fn check(&self, role: &ClusterRole, hosts: &BTreeSet<String>) -> Result<bool> {
        match role {
            ClusterRole::Shard(_) => {
                tracing::debug!("Cannot run read/write check on shard, must run via config-server.");
                Ok(false)
            }
            ClusterRole::ConfigServer(_) => self.is_sharded_cluster_read_write_healthy().await,
            ClusterRole::Replication => self.is_replica_set_read_write_healthy(hosts).await,
        }
    }

    /// Not supported yet. Reports failure so no upgrade is ever gated on it.
    pub async fn is_sharded_cluster_read_write_healthy(&self) -> Result<bool> {
        tracing::warn!("Read/write check across shards is not supported, reporting cluster as unable to read/write");
        Ok(false)
    }

    /// Writes a marker via the primary and reads it back on every other host.
    pub async fn is_replica_set_read_write_healthy(&self, hosts: &BTreeSet<String>) -> Result<bool> {
        let record = ProbeRecord::random(self.token_len);
        let verified = self.write_and_verify(&record, hosts).await;
        let cleanup = self.clear(&record).await;

        match (verified, cleanup) {
            (Ok(healthy), Ok(())) => Ok(healthy),
            (Ok(_), Err(e)) => {
                tracing::error!("Failed to drop probe collection {}: {}", record.collection_name, e);
                Err(e)
            }
            (Err(e), cleanup) => {
                if let Err(ce) = cleanup {
                    tracing::error!("Failed to drop probe collection {}: {}", record.collection_name, ce);
                }
                Err(e)
            }
        }
    }

    async fn write_and_verify(&self, record: &ProbeRecord, hosts: &BTreeSet<String>) -> Result<bool> {
        let primary = {
            let session = self.factory.connect(&SessionTarget::Local).await?;
            session
                .insert_marker(&record.collection_name, &record.write_value)
                .await?;
            session.current_primary().await?
        };

        let secondaries = hosts
            .iter()
            .filter(|h| primary.as_deref() != Some(h.as_str()));
        for host in secondaries {
            if !self.has_marker(host, record).await {
                tracing::debug!("Secondary with IP {} does not contain the expected write.", host);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn has_marker(&self, host: &str, record: &ProbeRecord) -> bool {
        let session = match self.factory.connect(&SessionTarget::direct(host)).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("Cannot connect to {}: {}", host, e);
                return false;
            }
        };
        match session.find_marker(&record.collection_name).await {
            Ok(found) => found.as_deref() == Some(record.write_value.as_str()),
            Err(e) => {
                tracing::debug!("Cannot read probe collection on {}: {}", host, e);
                false
            }
        }
    }

    async fn clear(&self, record: &ProbeRecord) -> Result<()> {
        let session = self.factory.connect(&SessionTarget::Local).await?;
        session.drop_collection(&record.collection_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::ShardRole;
    use crate::sim::SimCluster;

    fn hosts(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_random_record_shape() {
        let a = ProbeRecord::random(16);
        let b = ProbeRecord::random(16);
        assert!(a.collection_name.starts_with("collection_"));
        assert!(a.write_value.starts_with("unique_write_"));
        assert_eq!(a.collection_name.len(), "collection_".len() + 16);
        assert!(a.collection_name["collection_".len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_replicated_write_is_healthy_and_cleaned_up() {
        let members = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
        let cluster = SimCluster::replica_set(&members);
        let probe = ReadWriteProbe::new(&cluster, 16);
        assert!(probe
            .is_replica_set_read_write_healthy(&hosts(&members))
            .await
            .unwrap());
        for host in members {
            assert!(cluster.collections_on(host).is_empty());
        }
        assert_eq!(cluster.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_lagging_secondary_fails_and_still_cleans_up() {
        let members = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
        let cluster = SimCluster::replica_set(&members);
        cluster.set_lagging("10.0.0.3", true);
        let probe = ReadWriteProbe::new(&cluster, 16);
        assert!(!probe
            .is_replica_set_read_write_healthy(&hosts(&members))
            .await
            .unwrap());
        assert!(cluster.collections_on("10.0.0.1").is_empty());
        assert_eq!(cluster.command_count("drop"), 1);
    }

    #[tokio::test]
    async fn test_failed_write_still_drops_collection() {
        let cluster = SimCluster::replica_set(&["10.0.0.1", "10.0.0.2"]);
        cluster.fail_next("insert", None, "not writable");
        let probe = ReadWriteProbe::new(&cluster, 16);
        assert!(probe
            .is_replica_set_read_write_healthy(&hosts(&["10.0.0.1", "10.0.0.2"]))
            .await
            .is_err());
        assert_eq!(cluster.command_count("drop"), 1);
    }

    #[tokio::test]
    async fn test_sharded_and_shard_probes_report_failure() {
        let cluster = SimCluster::replica_set(&["10.0.0.1"]);
        let probe = ReadWriteProbe::new(&cluster, 16);
        assert!(!probe.is_sharded_cluster_read_write_healthy().await.unwrap());
        let shard = ClusterRole::Shard(ShardRole {
            shard_name: "s1".into(),
        });
        assert!(!probe.check(&shard, &hosts(&["10.0.0.1"])).await.unwrap());
        assert_eq!(cluster.command_count("insert"), 0);
    }
}
