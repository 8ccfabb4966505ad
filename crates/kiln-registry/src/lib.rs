//! Module registry for kiln.
//!
//! A module is a value: [`ModuleInfo`] metadata (kind, atomicity, set-ness,
//! option schema, companion meta module) paired with a [`ModuleBody`] that
//! implements one of the capability traits. Module bodies reach the
//! dispatcher only through the [`Host`] they are handed on each call.
//!
//! Modules are compiled in and collected in a [`Catalog`]. A [`Registry`]
//! is filled either from the whole catalog or by discovery, which enables
//! the catalog entries named by `module.toml` manifests found under
//! `<root>/<kind>/<name>/`.

pub mod error;
pub mod host;
pub mod manifest;
pub mod module;
pub mod registry;

pub use error::{DispatchError, DispatchResult, RegistryError, RegistryResult};
pub use host::Host;
pub use manifest::{Manifest, MANIFEST_FILE};
pub use module::{
    Analyzer, Extractor, MapReducer, Module, ModuleBody, ModuleInfo, ModuleKind, Source,
};
pub use registry::{Catalog, Registry, PRIORITY_SOURCES};
