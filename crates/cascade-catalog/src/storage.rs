//! External storage seam used by `StoreData`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use cascade_core::EngineError;

/// Backend for `StoreData`. Implementations decide what the namespaces
/// (`localStorage`, `sessionStorage`, `file`) actually map to.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), EngineError>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, EngineError>;
}

/// In-memory storage for tests and standalone embedding.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), EngineError> {
        self.entries
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, EngineError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_then_get() {
        let storage = MemoryStorage::new();
        storage
            .put("localStorage", "users", json!([1, 2]))
            .await
            .unwrap();
        assert_eq!(
            storage.get("localStorage", "users").await.unwrap(),
            Some(json!([1, 2]))
        );
        // namespaces are isolated
        assert_eq!(storage.get("sessionStorage", "users").await.unwrap(), None);
    }
}
