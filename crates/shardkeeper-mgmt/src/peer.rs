//! Replicated key-value state shared between the units of one role.
//!
//! All values are strings in a flat map. Only the leader writes, except the
//! upgrade failure marker, which the unit whose upgrade failed records.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::topology::RelationId;

pub mod keys {
    pub const DRAINED: &str = "drained";
    pub const UPGRADE_STACK: &str = "upgrade_stack";
    pub const UPGRADE_FAILED: &str = "upgrade_failed";
    pub const HOSTS: &str = "host";
    pub const OPERATOR_PASSWORD: &str = "operator-password";
    pub const KEYFILE: &str = "key-file";
    pub const DB_INITIALISED: &str = "db_initialised";
}

/// Application-scoped peer data.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Application data bags of the relations to other roles.
#[async_trait]
pub trait RelationData: Send + Sync {
    /// Relations currently established.
    async fn relation_ids(&self) -> Result<Vec<RelationId>>;
    /// Merges `data` into the local application's bag for one relation.
    async fn update(&self, relation_id: RelationId, data: BTreeMap<String, String>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryPeerStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().await.clone()
    }
}

#[async_trait]
impl PeerStore for InMemoryPeerStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRelationData {
    bags: RwLock<BTreeMap<RelationId, BTreeMap<String, String>>>,
}

impl InMemoryRelationData {
    pub fn with_relations(ids: impl IntoIterator<Item = RelationId>) -> Self {
        Self {
            bags: RwLock::new(ids.into_iter().map(|id| (id, BTreeMap::new())).collect()),
        }
    }

    pub async fn bag(&self, relation_id: RelationId) -> BTreeMap<String, String> {
        self.bags
            .read()
            .await
            .get(&relation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RelationData for InMemoryRelationData {
    async fn relation_ids(&self) -> Result<Vec<RelationId>> {
        Ok(self.bags.read().await.keys().copied().collect())
    }

    async fn update(&self, relation_id: RelationId, data: BTreeMap<String, String>) -> Result<()> {
        self.bags
            .write()
            .await
            .entry(relation_id)
            .or_default()
            .extend(data);
        Ok(())
    }
}

/// Typed accessors over the flat string map.
pub struct PeerData<'a> {
    store: &'a dyn PeerStore,
}

impl<'a> PeerData<'a> {
    pub fn new(store: &'a dyn PeerStore) -> Self {
        Self { store }
    }

    /// Absent means the leader has not observed a completed drain yet.
    pub async fn drained(&self) -> Result<bool> {
        match self.store.get(keys::DRAINED).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(false),
        }
    }

    pub async fn set_drained(&self, drained: bool) -> Result<()> {
        self.store
            .set(keys::DRAINED, serde_json::to_string(&drained)?)
            .await
    }

    pub async fn upgrade_stack(&self) -> Result<Vec<u32>> {
        match self.store.get(keys::UPGRADE_STACK).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_upgrade_stack(&self, stack: &[u32]) -> Result<()> {
        self.store
            .set(keys::UPGRADE_STACK, serde_json::to_string(stack)?)
            .await
    }

    /// Member whose upgrade halted the campaign, until recovery clears it.
    pub async fn upgrade_failed(&self) -> Result<Option<u32>> {
        match self.store.get(keys::UPGRADE_FAILED).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_upgrade_failed(&self, member_id: Option<u32>) -> Result<()> {
        match member_id {
            Some(id) => {
                self.store
                    .set(keys::UPGRADE_FAILED, serde_json::to_string(&id)?)
                    .await
            }
            None => self.store.remove(keys::UPGRADE_FAILED).await,
        }
    }

    pub async fn hosts(&self) -> Result<BTreeSet<String>> {
        match self.store.get(keys::HOSTS).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(BTreeSet::new()),
        }
    }

    pub async fn db_initialised(&self) -> Result<bool> {
        Ok(self.store.get(keys::DB_INITIALISED).await?.is_some())
    }

    pub async fn secret(&self, key: &str) -> Result<Option<String>> {
        self.store.get(key).await
    }

    pub async fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        self.store.set(key, value.to_string()).await
    }
}

/// Encodes a host list the way it travels in relation data.
pub fn encode_hosts<'h>(hosts: impl IntoIterator<Item = &'h String>) -> Result<String> {
    let hosts: Vec<&String> = hosts.into_iter().collect();
    Ok(serde_json::to_string(&hosts)?)
}

pub fn decode_hosts(raw: &str) -> Result<BTreeSet<String>> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordError;

    #[tokio::test]
    async fn test_drained_defaults_to_false() {
        let store = InMemoryPeerStore::new();
        let data = PeerData::new(&store);
        assert!(!data.drained().await.unwrap());
        data.set_drained(true).await.unwrap();
        assert!(data.drained().await.unwrap());
        assert_eq!(store.snapshot().await[keys::DRAINED], "true");
    }

    #[tokio::test]
    async fn test_upgrade_stack_is_json_list() {
        let store = InMemoryPeerStore::new();
        let data = PeerData::new(&store);
        assert!(data.upgrade_stack().await.unwrap().is_empty());
        data.set_upgrade_stack(&[2, 1, 0]).await.unwrap();
        assert_eq!(store.snapshot().await[keys::UPGRADE_STACK], "[2,1,0]");
        assert_eq!(data.upgrade_stack().await.unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_upgrade_failed_marker_cleared_by_none() {
        let store = InMemoryPeerStore::new();
        let data = PeerData::new(&store);
        assert_eq!(data.upgrade_failed().await.unwrap(), None);
        data.set_upgrade_failed(Some(2)).await.unwrap();
        assert_eq!(store.snapshot().await[keys::UPGRADE_FAILED], "2");
        assert_eq!(data.upgrade_failed().await.unwrap(), Some(2));
        data.set_upgrade_failed(None).await.unwrap();
        assert!(!store.snapshot().await.contains_key(keys::UPGRADE_FAILED));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_serialization_error() {
        let store = InMemoryPeerStore::new();
        store.set(keys::UPGRADE_STACK, "[1,".into()).await.unwrap();
        let err = PeerData::new(&store).upgrade_stack().await.unwrap_err();
        assert!(matches!(err, CoordError::Serialization(_)));
    }

    #[test]
    fn test_hosts_codec() {
        let hosts: BTreeSet<String> = ["10.0.0.2".to_string(), "10.0.0.1".to_string()].into();
        let raw = encode_hosts(&hosts).unwrap();
        assert_eq!(raw, r#"["10.0.0.1","10.0.0.2"]"#);
        assert_eq!(decode_hosts(&raw).unwrap(), hosts);
    }

    #[tokio::test]
    async fn test_relation_data_merges() {
        let relations = InMemoryRelationData::with_relations([3]);
        relations
            .update(3, BTreeMap::from([("a".to_string(), "1".to_string())]))
            .await
            .unwrap();
        relations
            .update(3, BTreeMap::from([("b".to_string(), "2".to_string())]))
            .await
            .unwrap();
        assert_eq!(relations.bag(3).await.len(), 2);
        assert_eq!(relations.relation_ids().await.unwrap(), vec![3]);
    }
}
