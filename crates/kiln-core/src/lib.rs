//! The kiln dispatcher.
//!
//! Ties configuration, the artifact store and the module registry together
//! and evaluates modules over OIDs on demand. Results are cached as
//! artifacts; a request for an existing artifact never recomputes it, and
//! concurrent requests for a missing one compute it once.
//!
//! # Components
//!
//! - [`Config`] -- TOML configuration with defaults and dotted-key access
//! - [`Context`] -- config, store and registry bundled for one process
//! - [`Dispatcher`] -- process, retrieve, flush and normalization
//! - collections, tags and import -- further `Dispatcher` operations over
//!   the built-in sources
//! - [`WorkerPool`] -- fixed-size fan-out over a batch of OIDs

pub mod collections;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod import;
pub mod pool;
pub mod progress;
pub mod sources;
pub mod tags;

#[cfg(test)]
pub(crate) mod testing;

pub use collections::CollectionInfo;
pub use config::{Config, CONFIG_FILE, HOME_ENV};
pub use context::{build_registry, Context, ContextBuilder};
pub use dispatcher::{BatchReport, Dispatcher, FlushReport, OidFailure};
pub use error::{ConfigError, ConfigResult};
pub use import::ImportReport;
pub use pool::WorkerPool;
pub use progress::{Progress, ProgressSnapshot};
pub use sources::{builtin_sources, BUILTIN_SOURCES, COLLECTIONS, COLLECTIONS_META, FILES, FILE_META, TAGS};

// Re-export what callers need to drive a dispatcher.
pub use kiln_options::Options;
pub use kiln_registry::{Catalog, DispatchError, DispatchResult, Module, ModuleInfo, ModuleKind};
pub use kiln_types::{Oid, Value};
