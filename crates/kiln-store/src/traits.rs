use std::time::Duration;

use kiln_types::{Oid, Value};

use crate::error::StoreResult;
use crate::key::ArtifactKey;
use crate::lock::{LockGuard, LockManager, LockMode};

/// Per-module artifact store.
///
/// All implementations must satisfy these invariants:
/// - A write is atomic: readers observe either the previous committed value
///   or the new one, never a partial artifact.
/// - Writes to one key are serialized by its write lock.
/// - Corrupt artifacts read as a miss, never as an error.
/// - The store never interprets values; it is a pure key-value store.
pub trait ArtifactStore: Send + Sync {
    /// The lock manager coordinating access to keys.
    fn locks(&self) -> &dyn LockManager;

    /// Bound on lock acquisition.
    fn lock_timeout(&self) -> Duration;

    /// Read an artifact without taking a lock.
    ///
    /// Returns `Ok(None)` when the artifact is absent or unreadable.
    fn read(&self, key: &ArtifactKey) -> StoreResult<Option<Value>>;

    /// Write an artifact, taking the key's write lock (reentrantly if the
    /// caller already holds it).
    fn write(&self, key: &ArtifactKey, value: &Value) -> StoreResult<()>;

    /// Check whether an artifact exists.
    fn exists(&self, key: &ArtifactKey) -> StoreResult<bool>;

    /// Delete one artifact. Returns `true` if it existed.
    fn delete(&self, key: &ArtifactKey) -> StoreResult<bool>;

    /// Delete every artifact of `module` for `oid`, whatever its fingerprint.
    fn delete_oid(&self, module: &str, oid: &Oid) -> StoreResult<usize>;

    /// All artifact keys stored for a module.
    fn list_keys(&self, module: &str) -> StoreResult<Vec<ArtifactKey>>;

    /// Names of all modules with a storage area.
    fn modules(&self) -> StoreResult<Vec<String>>;

    /// Delete every artifact of a module.
    fn flush_module(&self, module: &str) -> StoreResult<usize>;

    /// Acquire a lock on `key`, released when the guard drops.
    fn lock(&self, key: &ArtifactKey, mode: LockMode) -> StoreResult<LockGuard<'_>> {
        let token = self.locks().acquire(key, mode, self.lock_timeout())?;
        Ok(LockGuard::new(self.locks(), token))
    }

    /// Read an artifact while holding its reader lock.
    fn read_locked(&self, key: &ArtifactKey) -> StoreResult<Option<Value>> {
        let guard = self.lock(key, LockMode::Read)?;
        let value = self.read(key)?;
        guard.release()?;
        Ok(value)
    }

    /// Distinct OIDs stored for a module, sorted.
    fn list_oids(&self, module: &str) -> StoreResult<Vec<Oid>> {
        let mut oids: Vec<Oid> = self.list_keys(module)?.into_iter().map(|k| k.oid).collect();
        oids.sort();
        oids.dedup();
        Ok(oids)
    }

    /// Read-modify-write under the key's write lock.
    fn update(
        &self,
        key: &ArtifactKey,
        f: &mut dyn FnMut(Option<Value>) -> Value,
    ) -> StoreResult<Value> {
        let guard = self.lock(key, LockMode::Write)?;
        let next = f(self.read(key)?);
        self.write(key, &next)?;
        guard.release()?;
        Ok(next)
    }
}
