//! Built-in source modules.
//!
//! Sources own data that enters through import and collection operations
//! rather than through computation. Their bodies only report whether every
//! requested OID is already stored.

use kiln_options::Options;
use kiln_registry::{Catalog, DispatchResult, Host, Module, ModuleInfo, ModuleKind, Source};
use kiln_types::Oid;

pub const FILES: &str = "files";
pub const FILE_META: &str = "file_meta";
pub const COLLECTIONS: &str = "collections";
pub const COLLECTIONS_META: &str = "collections_meta";
pub const TAGS: &str = "tags";

/// Names of every built-in source.
pub const BUILTIN_SOURCES: [&str; 5] = [FILES, FILE_META, COLLECTIONS, COLLECTIONS_META, TAGS];

/// A source whose artifacts are written by core operations only.
struct StoredOnly {
    name: String,
}

impl Source for StoredOnly {
    fn process(&self, host: &dyn Host, oids: &[Oid], opts: &Options) -> DispatchResult<bool> {
        for oid in oids {
            if host.load(&self.name, oid, opts)?.is_none() {
                tracing::debug!(source = %self.name, %oid, "not stored");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn stored_only(info: ModuleInfo) -> Module {
    let name = info.name.clone();
    Module::source(info, StoredOnly { name })
}

/// The sources every registry carries.
pub fn builtin_sources() -> Catalog {
    Catalog::new()
        .with(stored_only(
            ModuleInfo::new(FILES, ModuleKind::Source)
                .atomic()
                .with_meta(FILE_META)
                .describe("Imported file contents, keyed by the SHA-1 of the bytes"),
        ))
        .with(stored_only(
            ModuleInfo::new(FILE_META, ModuleKind::Source)
                .describe("Names, size, stat and import paths of imported files"),
        ))
        .with(stored_only(
            ModuleInfo::new(COLLECTIONS, ModuleKind::Source)
                .set_valued()
                .with_meta(COLLECTIONS_META)
                .describe("Named sets of OIDs, keyed by the SHA-1 of their sorted members"),
        ))
        .with(stored_only(
            ModuleInfo::new(COLLECTIONS_META, ModuleKind::Source)
                .describe("Name, notes and member count of each collection"),
        ))
        .with(stored_only(
            ModuleInfo::new(TAGS, ModuleKind::Source).describe("User tags attached to OIDs"),
        ))
}
