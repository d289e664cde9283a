use crate::error::StorageError;
use crate::node::{NodeKey, ProvisionedNode};
use crate::snapshot::NodeSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Repository for node records.
///
/// Records are kept as [`NodeSnapshot`]s; `load` restores them, which
/// recomputes derived keys and runs any pending schema upgrade. A record that
/// fails to restore is an error, never a default node.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    async fn load(&self, key: &NodeKey) -> Result<Option<ProvisionedNode>, StorageError>;
    async fn save(&self, node: &ProvisionedNode) -> Result<(), StorageError>;
    async fn remove(&self, key: &NodeKey) -> Result<bool, StorageError>;
    async fn list(&self) -> Result<Vec<NodeKey>, StorageError>;
}

fn restore(key: &NodeKey, snapshot: NodeSnapshot) -> Result<ProvisionedNode, StorageError> {
    snapshot
        .restore()
        .map_err(|source| StorageError::CorruptRecord {
            key: key.to_string(),
            source,
        })
}

pub struct InMemoryNodeStore {
    records: Arc<RwLock<HashMap<NodeKey, NodeSnapshot>>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Stores a raw record as-is, e.g. one imported from an older schema.
    pub async fn insert_snapshot(&self, snapshot: NodeSnapshot) {
        let key = NodeKey {
            network_id: snapshot.network_id,
            device_uuid: snapshot.device_uuid,
        };
        self.records.write().await.insert(key, snapshot);
    }
}

impl Default for InMemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn load(&self, key: &NodeKey) -> Result<Option<ProvisionedNode>, StorageError> {
        let snapshot = self.records.read().await.get(key).cloned();
        snapshot.map(|s| restore(key, s)).transpose()
    }

    async fn save(&self, node: &ProvisionedNode) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(node.key(), node.snapshot());
        Ok(())
    }

    async fn remove(&self, key: &NodeKey) -> Result<bool, StorageError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<NodeKey>, StorageError> {
        let mut keys: Vec<NodeKey> = self.records.read().await.keys().copied().collect();
        keys.sort();
        Ok(keys)
    }
}

pub struct SledNodeStore {
    db: sled::Db,
}

impl SledNodeStore {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|source| StorageError::DatabaseOpen {
            name: path.to_string(),
            source,
        })?;
        Ok(Self { db })
    }

    fn record_key(key: &NodeKey) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(key.network_id.as_bytes());
        bytes.extend_from_slice(key.device_uuid.as_bytes());
        bytes
    }

    /// Stores a raw record as-is, e.g. one imported from an older schema.
    pub fn insert_snapshot(&self, snapshot: &NodeSnapshot) -> Result<(), StorageError> {
        let key = NodeKey {
            network_id: snapshot.network_id,
            device_uuid: snapshot.device_uuid,
        };
        let value = snapshot
            .to_bytes()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.db
            .insert(Self::record_key(&key), value)
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl NodeStore for SledNodeStore {
    async fn load(&self, key: &NodeKey) -> Result<Option<ProvisionedNode>, StorageError> {
        let value = self
            .db
            .get(Self::record_key(key))
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
        let Some(value) = value else {
            return Ok(None);
        };

        let snapshot = NodeSnapshot::from_bytes(&value)
            .map_err(|e| StorageError::Serialization(format!("{}: {}", key, e)))?;
        restore(key, snapshot).map(Some)
    }

    async fn save(&self, node: &ProvisionedNode) -> Result<(), StorageError> {
        self.insert_snapshot(&node.snapshot())?;
        tracing::debug!("💾 Saved node {}", node.key());
        Ok(())
    }

    async fn remove(&self, key: &NodeKey) -> Result<bool, StorageError> {
        let removed = self
            .db
            .remove(Self::record_key(key))
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
        Ok(removed.is_some())
    }

    async fn list(&self) -> Result<Vec<NodeKey>, StorageError> {
        self.db
            .iter()
            .keys()
            .map(|item| {
                let key = item.map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
                if key.len() != 32 {
                    return Err(StorageError::Serialization(format!(
                        "unexpected record key length {}",
                        key.len()
                    )));
                }
                let network_id = uuid::Uuid::from_slice(&key[..16])
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                let device_uuid = uuid::Uuid::from_slice(&key[16..])
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(NodeKey {
                    network_id,
                    device_uuid,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::provisioning_result;
    use uuid::Uuid;

    fn node() -> ProvisionedNode {
        ProvisionedNode::new(Uuid::from_bytes([3u8; 16]), provisioning_result(0x0004, 1)).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_save_load_remove() {
        let store = InMemoryNodeStore::new();
        let node = node();

        store.save(&node).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![node.key()]);
        assert_eq!(store.load(&node.key()).await.unwrap(), Some(node.clone()));

        assert!(store.remove(&node.key()).await.unwrap());
        assert!(store.load(&node.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_surfaces() {
        let store = InMemoryNodeStore::new();
        let mut snapshot = node().snapshot();
        snapshot.device_key = "not-hex".to_string();
        let key = NodeKey {
            network_id: snapshot.network_id,
            device_uuid: snapshot.device_uuid,
        };
        store.insert_snapshot(snapshot).await;

        assert!(matches!(
            store.load(&key).await,
            Err(StorageError::CorruptRecord { .. })
        ));
    }

    #[tokio::test]
    async fn test_sled_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes");
        let path = path.to_str().unwrap();
        let node = node();

        {
            let store = SledNodeStore::new(path).unwrap();
            store.save(&node).await.unwrap();
        }

        let store = SledNodeStore::new(path).unwrap();
        assert_eq!(store.list().await.unwrap(), vec![node.key()]);
        assert_eq!(store.load(&node.key()).await.unwrap(), Some(node.clone()));
        assert!(store.remove(&node.key()).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }
}
