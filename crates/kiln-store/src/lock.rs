//! Multi-reader / single-writer locking for artifact keys.
//!
//! The [`LockManager`] trait is the seam between the store and its
//! coordination strategy. Two implementations exist:
//!
//! - [`FileLockManager`]: the lockfile protocol. Lockfiles live beside the
//!   artifacts as `<stem>.write` (exclusive writer) or `<stem>.<n>` (reader
//!   slot `n`) and are taken with an exclusive create. Works across
//!   processes.
//! - [`MemoryLockManager`]: the same semantics inside one process, built on
//!   a `Mutex` and `Condvar`. Used by the in-memory store.
//!
//! Both keep a lock table keyed by owning thread. A thread that already holds
//! a key succeeds immediately (reentrant); other threads, even in the same
//! process, go through the full protocol.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::key::{validate_module_name, ArtifactKey};

/// Sleep between lockfile polls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Requested lock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Receives lock traffic. Acquisition is reported after the lock is held;
/// release is reported before it is given up.
pub trait LockObserver: Send + Sync {
    fn acquired(&self, key: &ArtifactKey, mode: LockMode);
    fn released(&self, key: &ArtifactKey, mode: LockMode);
}

/// Proof of a held lock, handed back to [`LockManager::release`].
#[derive(Clone, Debug)]
pub struct LockToken {
    pub key: ArtifactKey,
    pub mode: LockMode,
    owner: ThreadId,
}

/// Coordination strategy for artifact keys.
pub trait LockManager: Send + Sync {
    /// Acquire `key` in `mode`, waiting at most `timeout`.
    fn acquire(&self, key: &ArtifactKey, mode: LockMode, timeout: Duration)
        -> StoreResult<LockToken>;

    /// Release a previously acquired lock.
    fn release(&self, token: &LockToken) -> StoreResult<()>;

    /// Release every lock held by this process, regardless of owner.
    fn release_all(&self);

    /// Returns `true` if the calling thread holds `key`.
    fn is_held(&self, key: &ArtifactKey) -> bool;
}

/// RAII guard that releases its lock on drop.
pub struct LockGuard<'a> {
    manager: &'a dyn LockManager,
    token: Option<LockToken>,
}

impl<'a> LockGuard<'a> {
    pub fn new(manager: &'a dyn LockManager, token: LockToken) -> Self {
        Self {
            manager,
            token: Some(token),
        }
    }

    pub fn mode(&self) -> Option<LockMode> {
        self.token.as_ref().map(|t| t.mode)
    }

    /// Release now and surface any error instead of logging it.
    pub fn release(mut self) -> StoreResult<()> {
        match self.token.take() {
            Some(token) => self.manager.release(&token),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.manager.release(&token) {
                warn!(key = %token.key, error = %e, "failed to release lock");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FileLockManager
// ---------------------------------------------------------------------------

struct HeldFileLock {
    key: ArtifactKey,
    mode: LockMode,
    path: PathBuf,
    depth: usize,
    _file: File,
}

/// Lockfile-based [`LockManager`] rooted at the artifact database directory.
pub struct FileLockManager {
    root: PathBuf,
    table: Mutex<HashMap<(PathBuf, ThreadId), HeldFileLock>>,
    observer: Option<Arc<dyn LockObserver>>,
}

impl FileLockManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            table: Mutex::new(HashMap::new()),
            observer: None,
        }
    }

    /// Attach an observer that sees every acquire and release.
    pub fn with_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Number of locks currently held by this process.
    pub fn held_count(&self) -> usize {
        self.lock_table().len()
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<(PathBuf, ThreadId), HeldFileLock>> {
        // A poisoned table still holds valid entries; keep using it.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stem_path(&self, key: &ArtifactKey) -> StoreResult<PathBuf> {
        validate_module_name(&key.module)?;
        Ok(self.root.join(&key.module).join(key.lock_stem()))
    }

    /// Scan the key's directory for existing lockfiles.
    ///
    /// Returns whether a writer lock exists and the reader slots in use.
    fn scan(dir: &Path, stem: &str) -> StoreResult<(bool, Vec<u64>)> {
        let mut writer = false;
        let mut readers = Vec::new();
        let prefix = format!("{stem}.");
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((false, readers)),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(disc) = name.strip_prefix(&prefix) else {
                continue;
            };
            if disc == "write" {
                writer = true;
            } else if let Ok(slot) = disc.parse::<u64>() {
                readers.push(slot);
            }
        }
        Ok((writer, readers))
    }

    fn try_create(path: &Path) -> StoreResult<Option<File>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// One attempt at the protocol. Returns the created lockfile on success.
    fn attempt(
        stem_path: &Path,
        mode: LockMode,
    ) -> StoreResult<Option<(PathBuf, File)>> {
        let dir = stem_path.parent().unwrap_or(Path::new("."));
        let stem = stem_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let write_path = dir.join(format!("{stem}.write"));

        if write_path.exists() {
            return Ok(None);
        }
        let (writer, readers) = Self::scan(dir, stem)?;
        if writer {
            return Ok(None);
        }

        match mode {
            LockMode::Write => {
                if !readers.is_empty() {
                    return Ok(None);
                }
                let Some(file) = Self::try_create(&write_path)? else {
                    return Ok(None);
                };
                // A reader may have slipped in between the scan and the create.
                let (_, readers) = Self::scan(dir, stem)?;
                if !readers.is_empty() {
                    drop(file);
                    fs::remove_file(&write_path)?;
                    return Ok(None);
                }
                Ok(Some((write_path, file)))
            }
            LockMode::Read => {
                let slot = readers.iter().max().map_or(0, |max| max + 1);
                let path = dir.join(format!("{stem}.{slot}"));
                let Some(file) = Self::try_create(&path)? else {
                    return Ok(None);
                };
                // Likewise a writer may have been created concurrently.
                if write_path.exists() {
                    drop(file);
                    fs::remove_file(&path)?;
                    return Ok(None);
                }
                Ok(Some((path, file)))
            }
        }
    }
}

impl LockManager for FileLockManager {
    fn acquire(
        &self,
        key: &ArtifactKey,
        mode: LockMode,
        timeout: Duration,
    ) -> StoreResult<LockToken> {
        let stem_path = self.stem_path(key)?;
        let owner = thread::current().id();

        {
            let mut table = self.lock_table();
            if let Some(held) = table.get_mut(&(stem_path.clone(), owner)) {
                if held.mode == LockMode::Read && mode == LockMode::Write {
                    return Err(StoreError::LockUpgrade(key.to_string()));
                }
                held.depth += 1;
                return Ok(LockToken {
                    key: key.clone(),
                    mode: held.mode,
                    owner,
                });
            }
        }

        if let Some(dir) = stem_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let start = Instant::now();
        loop {
            if let Some((path, file)) = Self::attempt(&stem_path, mode)? {
                self.lock_table().insert(
                    (stem_path, owner),
                    HeldFileLock {
                        key: key.clone(),
                        mode,
                        path,
                        depth: 1,
                        _file: file,
                    },
                );
                if let Some(observer) = &self.observer {
                    observer.acquired(key, mode);
                }
                debug!(key = %key, %mode, "lock acquired");
                return Ok(LockToken {
                    key: key.clone(),
                    mode,
                    owner,
                });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                warn!(key = %key, %mode, ?waited, "lock acquisition timed out");
                return Err(StoreError::LockTimeout {
                    key: key.to_string(),
                    waited,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn release(&self, token: &LockToken) -> StoreResult<()> {
        let stem_path = self.stem_path(&token.key)?;
        let held = {
            let mut table = self.lock_table();
            let map_key = (stem_path, token.owner);
            match table.get_mut(&map_key) {
                Some(held) if held.depth > 1 => {
                    held.depth -= 1;
                    return Ok(());
                }
                Some(_) => table.remove(&map_key),
                None => None,
            }
        };

        let Some(held) = held else {
            return Ok(());
        };
        if let Some(observer) = &self.observer {
            observer.released(&held.key, held.mode);
        }
        let path = held.path.clone();
        drop(held);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(key = %token.key, mode = %token.mode, "lock released");
        Ok(())
    }

    fn release_all(&self) {
        let drained: Vec<HeldFileLock> = self.lock_table().drain().map(|(_, v)| v).collect();
        for held in drained {
            if let Some(observer) = &self.observer {
                observer.released(&held.key, held.mode);
            }
            if let Err(e) = fs::remove_file(&held.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %held.path.display(), error = %e, "failed to remove lockfile");
                }
            }
        }
    }

    fn is_held(&self, key: &ArtifactKey) -> bool {
        let Ok(stem_path) = self.stem_path(key) else {
            return false;
        };
        self.lock_table()
            .contains_key(&(stem_path, thread::current().id()))
    }
}

impl std::fmt::Debug for FileLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockManager")
            .field("root", &self.root)
            .field("held", &self.held_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MemoryLockManager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct KeyState {
    writer: Option<(ThreadId, usize)>,
    readers: HashMap<ThreadId, usize>,
}

impl KeyState {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// In-process [`LockManager`] with the same reader/writer semantics.
#[derive(Default)]
pub struct MemoryLockManager {
    state: Mutex<HashMap<ArtifactKey, KeyState>>,
    changed: Condvar,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, HashMap<ArtifactKey, KeyState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LockManager for MemoryLockManager {
    fn acquire(
        &self,
        key: &ArtifactKey,
        mode: LockMode,
        timeout: Duration,
    ) -> StoreResult<LockToken> {
        let owner = thread::current().id();
        let start = Instant::now();
        let mut state = self.lock_state();
        loop {
            let entry = state.entry(key.clone()).or_default();

            if let Some((writer, depth)) = entry.writer.as_mut() {
                if *writer == owner {
                    *depth += 1;
                    return Ok(LockToken { key: key.clone(), mode: LockMode::Write, owner });
                }
            }
            if let Some(depth) = entry.readers.get_mut(&owner) {
                if mode == LockMode::Write {
                    return Err(StoreError::LockUpgrade(key.to_string()));
                }
                *depth += 1;
                return Ok(LockToken { key: key.clone(), mode: LockMode::Read, owner });
            }

            let granted = match mode {
                LockMode::Write if entry.is_free() => {
                    entry.writer = Some((owner, 1));
                    true
                }
                LockMode::Read if entry.writer.is_none() => {
                    entry.readers.insert(owner, 1);
                    true
                }
                _ => false,
            };
            if granted {
                return Ok(LockToken { key: key.clone(), mode, owner });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(StoreError::LockTimeout {
                    key: key.to_string(),
                    waited,
                });
            }
            let (next, _) = self
                .changed
                .wait_timeout(state, timeout - waited)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
    }

    fn release(&self, token: &LockToken) -> StoreResult<()> {
        let mut state = self.lock_state();
        if let Some(entry) = state.get_mut(&token.key) {
            if let Some((writer, depth)) = entry.writer.as_mut() {
                if *writer == token.owner {
                    *depth -= 1;
                    if *depth == 0 {
                        entry.writer = None;
                    }
                }
            } else if let Some(depth) = entry.readers.get_mut(&token.owner) {
                *depth -= 1;
                if *depth == 0 {
                    entry.readers.remove(&token.owner);
                }
            }
            if entry.is_free() {
                state.remove(&token.key);
            }
        }
        self.changed.notify_all();
        Ok(())
    }

    fn release_all(&self) {
        self.lock_state().clear();
        self.changed.notify_all();
    }

    fn is_held(&self, key: &ArtifactKey) -> bool {
        let owner = thread::current().id();
        self.lock_state().get(key).is_some_and(|entry| {
            entry.writer.is_some_and(|(w, _)| w == owner) || entry.readers.contains_key(&owner)
        })
    }
}
