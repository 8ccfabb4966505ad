use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use kiln_types::{Oid, Value};

use crate::error::StoreResult;
use crate::fs::DEFAULT_LOCK_TIMEOUT;
use crate::key::{validate_module_name, ArtifactKey};
use crate::lock::{LockManager, LockMode, MemoryLockManager};
use crate::traits::ArtifactStore;

/// In-memory, map-based artifact store.
///
/// Intended for tests and embedding. Values are cloned on read and write and
/// lost when the store is dropped. Locking uses [`MemoryLockManager`], so the
/// reader/writer semantics match the filesystem store within one process.
pub struct InMemoryArtifactStore {
    artifacts: RwLock<BTreeMap<ArtifactKey, Value>>,
    locks: MemoryLockManager,
    lock_timeout: Duration,
}

impl InMemoryArtifactStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            artifacts: RwLock::new(BTreeMap::new()),
            locks: MemoryLockManager::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Number of artifacts currently stored.
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, BTreeMap<ArtifactKey, Value>> {
        self.artifacts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, BTreeMap<ArtifactKey, Value>> {
        self.artifacts.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn locks(&self) -> &dyn LockManager {
        &self.locks
    }

    fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn read(&self, key: &ArtifactKey) -> StoreResult<Option<Value>> {
        validate_module_name(&key.module)?;
        Ok(self.read_map().get(key).cloned())
    }

    fn write(&self, key: &ArtifactKey, value: &Value) -> StoreResult<()> {
        validate_module_name(&key.module)?;
        let guard = self.lock(key, LockMode::Write)?;
        self.write_map().insert(key.clone(), value.clone());
        guard.release()
    }

    fn exists(&self, key: &ArtifactKey) -> StoreResult<bool> {
        Ok(self.read_map().contains_key(key))
    }

    fn delete(&self, key: &ArtifactKey) -> StoreResult<bool> {
        let guard = self.lock(key, LockMode::Write)?;
        let removed = self.write_map().remove(key).is_some();
        guard.release()?;
        Ok(removed)
    }

    fn delete_oid(&self, module: &str, oid: &Oid) -> StoreResult<usize> {
        let keys: Vec<ArtifactKey> = self
            .list_keys(module)?
            .into_iter()
            .filter(|k| &k.oid == oid)
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn list_keys(&self, module: &str) -> StoreResult<Vec<ArtifactKey>> {
        Ok(self
            .read_map()
            .keys()
            .filter(|k| k.module == module)
            .cloned()
            .collect())
    }

    fn modules(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self.read_map().keys().map(|k| k.module.clone()).collect();
        names.dedup();
        Ok(names)
    }

    fn flush_module(&self, module: &str) -> StoreResult<usize> {
        let mut removed = 0;
        for key in self.list_keys(module)? {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for InMemoryArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryArtifactStore")
            .field("artifact_count", &self.len())
            .finish()
    }
}
