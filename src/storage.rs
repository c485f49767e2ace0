use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::types::StorageEntry;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("missing key for {0}")]
    MissingKey(&'static str),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Key/value store collaborator, mirroring the host's async storage API.
#[async_trait]
pub trait AsyncStorage: Send + Sync {
    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError>;
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Reads every key and its value.
pub async fn read_all(storage: &dyn AsyncStorage) -> Result<Vec<StorageEntry>, StorageError> {
    let keys = storage.get_all_keys().await?;
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        let value = storage.get_item(&key).await?;
        entries.push(StorageEntry { key, value });
    }
    Ok(entries)
}

#[derive(Default)]
pub struct MemoryStorage {
    items: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AsyncStorage for MemoryStorage {
    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.read().keys().cloned().collect())
    }

    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.items.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_all_returns_sorted_entries() {
        let storage = MemoryStorage::new();
        storage.set_item("token", "abc").await.unwrap();
        storage.set_item("theme", "dark").await.unwrap();

        let entries = read_all(&storage).await.unwrap();
        assert_eq!(
            entries,
            vec![
                StorageEntry { key: "theme".into(), value: Some("dark".into()) },
                StorageEntry { key: "token".into(), value: Some("abc".into()) },
            ]
        );

        storage.clear().await.unwrap();
        assert!(read_all(&storage).await.unwrap().is_empty());
    }
}
