//! Object storage collaborator.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{ImagingError, Result};

/// The slice of object storage the image service needs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes every object under `prefix` and returns how many were removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
struct InMemoryStorageState {
    objects: BTreeMap<String, Vec<u8>>,
    fail_on_delete: bool,
}

/// In-memory object storage for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStorage {
    state: Arc<RwLock<InMemoryStorageState>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object, as a client upload would.
    pub fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.write().objects.insert(key.into(), data.into());
    }

    /// Configures deletes to fail.
    pub fn set_fail_on_delete(&self, fail: bool) {
        self.write().fail_on_delete = fail;
    }

    pub fn object_count(&self) -> usize {
        self.read().objects.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().objects.keys().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryStorageState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryStorageState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read().objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.write();
        if state.fail_on_delete {
            return Err(ImagingError::Storage("delete rejected".to_string()));
        }
        state.objects.remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let mut state = self.write();
        if state.fail_on_delete {
            return Err(ImagingError::Storage("delete rejected".to_string()));
        }
        let before = state.objects.len();
        state.objects.retain(|key, _| !key.starts_with(prefix));
        Ok(before - state.objects.len())
    }
}
