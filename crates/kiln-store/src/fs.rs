//! Filesystem artifact store.
//!
//! Layout under the database root:
//! ```text
//! <root>/<module>/<oid>                  # fingerprint empty
//! <root>/<module>/<oid>.<fingerprint>    # non-default mangle options
//! <root>/<module>/<oid>_<fp>_<module>.lock.{write,<n>}
//! ```
//!
//! Writers produce a temporary file in the module directory (its name carries
//! the process id) and rename it into place under the key's write lock.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_types::{Oid, Value};
use tracing::{debug, warn};

use crate::codec;
use crate::error::StoreResult;
use crate::key::{validate_module_name, ArtifactKey};
use crate::lock::{FileLockManager, LockManager, LockMode, LockObserver};
use crate::traits::ArtifactStore;

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// On-disk [`ArtifactStore`] using the lockfile protocol.
pub struct FsArtifactStore {
    root: PathBuf,
    locks: FileLockManager,
    lock_timeout: Duration,
    /// Temporary files currently being written by this process.
    inflight: Mutex<HashSet<PathBuf>>,
}

impl FsArtifactStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            locks: FileLockManager::new(&root),
            root,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            inflight: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.locks = FileLockManager::new(&self.root).with_observer(observer);
        self
    }

    /// The database root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path at which the artifact for `key` lives (whether or not it exists).
    pub fn artifact_path(&self, key: &ArtifactKey) -> StoreResult<PathBuf> {
        Ok(self.module_dir(&key.module)?.join(key.file_name()))
    }

    /// Release every lock held by this process and discard in-flight
    /// temporary files. Called on shutdown signals.
    pub fn emergency_cleanup(&self) {
        self.locks.release_all();
        let inflight: Vec<PathBuf> = self
            .inflight
            .lock()
            .map(|mut set| set.drain().collect())
            .unwrap_or_default();
        for path in inflight {
            let _ = fs::remove_file(&path);
        }
    }

    fn module_dir(&self, module: &str) -> StoreResult<PathBuf> {
        validate_module_name(module)?;
        Ok(self.root.join(module))
    }

    fn track(&self, path: &Path, active: bool) {
        if let Ok(mut set) = self.inflight.lock() {
            if active {
                set.insert(path.to_path_buf());
            } else {
                set.remove(path);
            }
        }
    }

    fn write_atomic(&self, dir: &Path, dest: &Path, data: &[u8]) -> StoreResult<()> {
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}.{}.", std::process::id()))
            .suffix(".tmp")
            .tempfile_in(dir)?;
        let tmp_path = tmp.path().to_path_buf();
        self.track(&tmp_path, true);

        let result = (|| -> StoreResult<()> {
            tmp.write_all(data)?;
            tmp.flush()?;
            match tmp.persist(dest) {
                Ok(_) => Ok(()),
                Err(e) => {
                    // Some platforms refuse to rename over an existing file.
                    // We hold the write lock, so removing and retrying is safe.
                    match fs::remove_file(dest) {
                        Ok(()) => {}
                        Err(rm) if rm.kind() == ErrorKind::NotFound => {}
                        Err(rm) => return Err(rm.into()),
                    }
                    e.file.persist(dest).map_err(|e| e.error)?;
                    Ok(())
                }
            }
        })();

        self.track(&tmp_path, false);
        result
    }

    fn module_entries(&self, module: &str) -> StoreResult<Vec<(ArtifactKey, PathBuf)>> {
        let dir = self.module_dir(module)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((oid, fingerprint)) = ArtifactKey::parse_file_name(name) {
                out.push((ArtifactKey::new(module, oid, fingerprint), entry.path()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn remove_locked(&self, key: &ArtifactKey, path: &Path) -> StoreResult<bool> {
        let guard = self.lock(key, LockMode::Write)?;
        let removed = match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        guard.release()?;
        Ok(removed)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn locks(&self) -> &dyn LockManager {
        &self.locks
    }

    fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn read(&self, key: &ArtifactKey) -> StoreResult<Option<Value>> {
        let path = self.artifact_path(key)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match codec::decode(&data) {
            Ok(value) => {
                debug!(key = %key, bytes = data.len(), "artifact read");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt artifact; treating as miss");
                Ok(None)
            }
        }
    }

    fn write(&self, key: &ArtifactKey, value: &Value) -> StoreResult<()> {
        let dir = self.module_dir(&key.module)?;
        fs::create_dir_all(&dir)?;
        let data = codec::encode(value)?;
        let dest = dir.join(key.file_name());

        let guard = self.lock(key, LockMode::Write)?;
        self.write_atomic(&dir, &dest, &data)?;
        guard.release()?;

        debug!(key = %key, bytes = data.len(), "artifact written");
        Ok(())
    }

    fn exists(&self, key: &ArtifactKey) -> StoreResult<bool> {
        Ok(self.artifact_path(key)?.is_file())
    }

    fn delete(&self, key: &ArtifactKey) -> StoreResult<bool> {
        let path = self.artifact_path(key)?;
        self.remove_locked(key, &path)
    }

    fn delete_oid(&self, module: &str, oid: &Oid) -> StoreResult<usize> {
        let mut removed = 0;
        for (key, path) in self.module_entries(module)? {
            if &key.oid == oid && self.remove_locked(&key, &path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn list_keys(&self, module: &str) -> StoreResult<Vec<ArtifactKey>> {
        Ok(self
            .module_entries(module)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    fn modules(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_module_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn flush_module(&self, module: &str) -> StoreResult<usize> {
        let mut removed = 0;
        for (key, path) in self.module_entries(module)? {
            if self.remove_locked(&key, &path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for FsArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsArtifactStore")
            .field("root", &self.root)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}
