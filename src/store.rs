//! In-memory object store kept in sync with the replicated log.
//!
//! The store is read-shared by external consumers and mutated only by the
//! committed-entry applier, or by local transactions that go through the
//! [`Proposer`] seam and commit once their proposal is accepted.

use std::collections::BTreeMap;
use std::sync::{RwLock, Weak};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One mutation of the object map. A proposal carries an ordered sequence
/// of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreAction {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Callback invoked under the applier once a proposal commits.
pub type Callback = Box<dyn FnOnce() + Send>;

/// The narrow proposal interface the store holds instead of the concrete
/// node, breaking the node/store ownership cycle.
#[tonic::async_trait]
pub trait Proposer: Send + Sync {
    async fn propose_value(&self, actions: Vec<StoreAction>, cb: Option<Callback>) -> Result<()>;
}

/// A batch of store actions staged by a local transaction.
#[derive(Debug, Default)]
pub struct Batch {
    actions: Vec<StoreAction>,
}

impl Batch {
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.actions.push(StoreAction::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.actions.push(StoreAction::Delete { key: key.into() });
    }
}

/// Keyed object map replicated through the log.
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    proposer: OnceCell<Weak<dyn Proposer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            objects: RwLock::new(BTreeMap::new()),
            proposer: OnceCell::new(),
        }
    }

    /// Binds the proposal path. Called once when the node takes ownership
    /// of the store.
    pub(crate) fn set_proposer(&self, proposer: Weak<dyn Proposer>) {
        let _ = self.proposer.set(proposer);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().unwrap().is_empty()
    }

    /// Applies a committed action sequence in one transaction.
    pub fn apply_actions(&self, actions: &[StoreAction]) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        for action in actions {
            match action {
                StoreAction::Put { key, value } => {
                    objects.insert(key.clone(), value.clone());
                }
                StoreAction::Delete { key } => {
                    objects.remove(key);
                }
            }
        }
        Ok(())
    }

    /// Stages a batch of mutations and replicates it through the proposer.
    /// The mutations become visible locally once the proposal commits.
    pub async fn update<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&mut Batch),
    {
        let proposer = self
            .proposer
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::ApplyNotSpecified)?;

        let mut batch = Batch::default();
        build(&mut batch);
        proposer.propose_value(batch.actions, None).await
    }

    /// Serializes the full object map for a snapshot.
    pub fn save(&self) -> Result<Vec<u8>> {
        let objects = self.objects.read().unwrap();
        Ok(bincode::serialize(&*objects)?)
    }

    /// Replaces the object map with snapshot contents.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        let restored: BTreeMap<String, Vec<u8>> = bincode::deserialize(data)?;
        *self.objects.write().unwrap() = restored;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_actions_in_order() {
        let store = MemoryStore::new();
        store
            .apply_actions(&[
                StoreAction::Put {
                    key: "a".into(),
                    value: b"1".to_vec(),
                },
                StoreAction::Put {
                    key: "b".into(),
                    value: b"2".to_vec(),
                },
                StoreAction::Delete { key: "a".into() },
            ])
            .unwrap();

        assert!(!store.contains("a"));
        assert_eq!(store.get("b"), Some(b"2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let store = MemoryStore::new();
        store
            .apply_actions(&[
                StoreAction::Put {
                    key: "k1".into(),
                    value: b"v1".to_vec(),
                },
                StoreAction::Put {
                    key: "k2".into(),
                    value: b"v2".to_vec(),
                },
            ])
            .unwrap();

        let data = store.save().unwrap();

        let restored = MemoryStore::new();
        restored.restore(&data).unwrap();
        assert_eq!(restored.get("k1"), Some(b"v1".to_vec()));
        assert_eq!(restored.get("k2"), Some(b"v2".to_vec()));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn restore_replaces_existing_state() {
        let store = MemoryStore::new();
        store
            .apply_actions(&[StoreAction::Put {
                key: "stale".into(),
                value: b"x".to_vec(),
            }])
            .unwrap();

        let empty = MemoryStore::new().save().unwrap();
        store.restore(&empty).unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn update_without_proposer_is_refused() {
        let store = MemoryStore::new();
        let err = store.update(|batch| batch.put("k", b"v".to_vec())).await;
        assert!(matches!(err, Err(Error::ApplyNotSpecified)));
    }
}
