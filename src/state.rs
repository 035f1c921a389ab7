//! Opaque per-agent blob persistence, for agents that do not use
//! event sourcing.
//!
//! A [StateStore] keeps one blob per agent id; a [ConfigStore] keeps one
//! blob per (agent type, agent id) pair. Both treat their values as opaque
//! bytes; the [StateStoreExt]/[ConfigStoreExt] extension traits layer the
//! JSON codec on top for convenience.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::AgentId;

/// All possible errors returned by the state and config stores.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    /// A stored value could not be decoded into the requested type.
    #[error("failed to decode stored value: {0}")]
    Decode(#[source] serde_json::Error),

    /// A value could not be encoded for storage.
    #[error("failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),

    /// The store implementation failed in an unspecified way.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Per-agent opaque state persistence.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the stored state of the agent, if any.
    async fn load(&self, id: &AgentId) -> Result<Option<Vec<u8>>, StateStoreError>;

    /// Stores the state of the agent, replacing any previous value.
    async fn save(&self, id: AgentId, state: Vec<u8>) -> Result<(), StateStoreError>;

    /// Deletes the stored state; returns whether a value was present.
    async fn delete(&self, id: &AgentId) -> Result<bool, StateStoreError>;

    /// Returns whether a state is stored for the agent.
    async fn exists(&self, id: &AgentId) -> Result<bool, StateStoreError>;
}

/// Per-(agent type, agent id) opaque configuration persistence.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Returns the stored configuration, if any.
    async fn load(
        &self,
        agent_type: &str,
        id: &AgentId,
    ) -> Result<Option<Vec<u8>>, StateStoreError>;

    /// Stores the configuration, replacing any previous value.
    async fn save(
        &self,
        agent_type: &str,
        id: AgentId,
        config: Vec<u8>,
    ) -> Result<(), StateStoreError>;

    /// Deletes the stored configuration; returns whether a value was present.
    async fn delete(&self, agent_type: &str, id: &AgentId) -> Result<bool, StateStoreError>;

    /// Returns whether a configuration is stored.
    async fn exists(&self, agent_type: &str, id: &AgentId) -> Result<bool, StateStoreError>;
}

/// In-memory implementation of the [StateStore] trait.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    backend: Arc<RwLock<HashMap<AgentId, Vec<u8>>>>,
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, id: &AgentId) -> Result<Option<Vec<u8>>, StateStoreError> {
        Ok(self.backend.read().get(id).cloned())
    }

    async fn save(&self, id: AgentId, state: Vec<u8>) -> Result<(), StateStoreError> {
        self.backend.write().insert(id, state);
        Ok(())
    }

    async fn delete(&self, id: &AgentId) -> Result<bool, StateStoreError> {
        Ok(self.backend.write().remove(id).is_some())
    }

    async fn exists(&self, id: &AgentId) -> Result<bool, StateStoreError> {
        Ok(self.backend.read().contains_key(id))
    }
}

/// In-memory implementation of the [ConfigStore] trait.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigStore {
    backend: Arc<RwLock<HashMap<(String, AgentId), Vec<u8>>>>,
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn load(
        &self,
        agent_type: &str,
        id: &AgentId,
    ) -> Result<Option<Vec<u8>>, StateStoreError> {
        Ok(self
            .backend
            .read()
            .get(&(agent_type.to_owned(), *id))
            .cloned())
    }

    async fn save(
        &self,
        agent_type: &str,
        id: AgentId,
        config: Vec<u8>,
    ) -> Result<(), StateStoreError> {
        self.backend
            .write()
            .insert((agent_type.to_owned(), id), config);
        Ok(())
    }

    async fn delete(&self, agent_type: &str, id: &AgentId) -> Result<bool, StateStoreError> {
        Ok(self
            .backend
            .write()
            .remove(&(agent_type.to_owned(), *id))
            .is_some())
    }

    async fn exists(&self, agent_type: &str, id: &AgentId) -> Result<bool, StateStoreError> {
        Ok(self
            .backend
            .read()
            .contains_key(&(agent_type.to_owned(), *id)))
    }
}

/// JSON convenience accessors over any [StateStore].
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Loads and decodes the agent's state.
    async fn load_json<T>(&self, id: &AgentId) -> Result<Option<T>, StateStoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.load(id).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(StateStoreError::Decode),
            None => Ok(None),
        }
    }

    /// Encodes and stores the agent's state.
    async fn save_json<T>(&self, id: AgentId, value: &T) -> Result<(), StateStoreError>
    where
        T: Serialize + Send + Sync,
    {
        let bytes = serde_json::to_vec(value).map_err(StateStoreError::Encode)?;
        self.save(id, bytes).await
    }
}

#[async_trait]
impl<T> StateStoreExt for T where T: StateStore + ?Sized {}

/// JSON convenience accessors over any [ConfigStore].
#[async_trait]
pub trait ConfigStoreExt: ConfigStore {
    /// Loads and decodes the configuration.
    async fn load_json<T>(
        &self,
        agent_type: &str,
        id: &AgentId,
    ) -> Result<Option<T>, StateStoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.load(agent_type, id).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(StateStoreError::Decode),
            None => Ok(None),
        }
    }

    /// Encodes and stores the configuration.
    async fn save_json<T>(
        &self,
        agent_type: &str,
        id: AgentId,
        value: &T,
    ) -> Result<(), StateStoreError>
    where
        T: Serialize + Send + Sync,
    {
        let bytes = serde_json::to_vec(value).map_err(StateStoreError::Encode)?;
        self.save(agent_type, id, bytes).await
    }
}

#[async_trait]
impl<T> ConfigStoreExt for T where T: ConfigStore + ?Sized {}

#[cfg(test)]
mod test {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Prefs {
        verbose: bool,
        retries: u32,
    }

    #[tokio::test]
    async fn state_store_lifecycle() {
        let store = InMemoryStateStore::default();
        let id = AgentId::new_v4();

        assert!(!store.exists(&id).await.unwrap());
        assert!(store.load(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap());

        store.save(id, vec![1, 2, 3]).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
        assert_eq!(Some(vec![1, 2, 3]), store.load(&id).await.unwrap());

        store.save(id, vec![4]).await.unwrap();
        assert_eq!(Some(vec![4]), store.load(&id).await.unwrap());

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn config_store_is_keyed_by_type_and_id() {
        let store = InMemoryConfigStore::default();
        let id = AgentId::new_v4();

        store.save("worker", id, vec![1]).await.unwrap();

        assert!(store.exists("worker", &id).await.unwrap());
        assert!(!store.exists("manager", &id).await.unwrap());
        assert!(!store.exists("worker", &AgentId::new_v4()).await.unwrap());

        assert!(store.delete("worker", &id).await.unwrap());
        assert!(!store.exists("worker", &id).await.unwrap());
    }

    #[tokio::test]
    async fn json_accessors_roundtrip() {
        let store = InMemoryStateStore::default();
        let id = AgentId::new_v4();

        let prefs = Prefs {
            verbose: true,
            retries: 3,
        };

        store.save_json(id, &prefs).await.unwrap();
        assert_eq!(Some(prefs), store.load_json::<Prefs>(&id).await.unwrap());

        let configs = InMemoryConfigStore::default();
        let prefs = Prefs {
            verbose: false,
            retries: 1,
        };

        configs.save_json("worker", id, &prefs).await.unwrap();
        assert_eq!(
            Some(prefs),
            configs.load_json::<Prefs>("worker", &id).await.unwrap()
        );
    }
}
