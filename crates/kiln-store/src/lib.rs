//! Per-module artifact storage for kiln.
//!
//! Every analysis result is an artifact addressed by
//! `(module, oid, fingerprint)` and stored as one file inside the module's
//! directory. The store guarantees that concurrent workers never corrupt or
//! double-write an artifact.
//!
//! # Components
//!
//! - [`ArtifactKey`] -- artifact address and its on-disk names
//! - [`codec`] -- bincode + zstd encoding (legacy uncompressed accepted)
//! - [`LockManager`] -- multi-reader/single-writer coordination, with
//!   [`FileLockManager`] (lockfiles) and [`MemoryLockManager`]
//! - [`ArtifactStore`] -- the storage trait, implemented by
//!   [`FsArtifactStore`] and [`InMemoryArtifactStore`]
//!
//! # Design Rules
//!
//! 1. Rename is the commit point; temporary files never become visible.
//! 2. Writes to a key happen only under its write lock.
//! 3. Readers never block readers.
//! 4. Corrupt artifacts are a cache miss, not an error.
//! 5. All I/O errors are propagated, never silently ignored.

pub mod cleanup;
pub mod codec;
pub mod error;
pub mod fs;
pub mod key;
pub mod lock;
pub mod memory;
pub mod traits;

pub use cleanup::install_cleanup_handler;
pub use error::{StoreError, StoreResult};
pub use fs::{FsArtifactStore, DEFAULT_LOCK_TIMEOUT};
pub use key::{validate_module_name, ArtifactKey};
pub use lock::{
    FileLockManager, LockGuard, LockManager, LockMode, LockObserver, LockToken, MemoryLockManager,
};
pub use memory::InMemoryArtifactStore;
pub use traits::ArtifactStore;
