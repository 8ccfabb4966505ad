use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use kiln_store::validate_module_name;

use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{find_manifests, Manifest};
use crate::module::{Module, ModuleInfo, ModuleKind};

/// Sources consulted first when resolving the owner of an OID.
pub const PRIORITY_SOURCES: [&str; 2] = ["collections", "files"];

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Compiled-in modules that discovery may enable.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    modules: BTreeMap<String, Module>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: Module) {
        self.modules.insert(module.info.name.clone(), module);
    }

    pub fn with(mut self, module: Module) -> Self {
        self.add(module);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl IntoIterator for Catalog {
    type Item = Module;
    type IntoIter = std::collections::btree_map::IntoValues<String, Module>;

    fn into_iter(self) -> Self::IntoIter {
        self.modules.into_values()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registered modules by name.
///
/// Built once at startup and then shared read-only.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    modules: BTreeMap<String, Arc<Module>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under its declared name.
    pub fn register(&mut self, module: Module) -> RegistryResult<()> {
        let name = module.info.name.clone();
        validate_module_name(&name).map_err(|_| RegistryError::InvalidName(name.clone()))?;
        if self.modules.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(module = %name, kind = %module.info.kind, "registered module");
        self.modules.insert(name, Arc::new(module));
        Ok(())
    }

    /// Register every module in a catalog.
    pub fn register_all(&mut self, catalog: Catalog) -> RegistryResult<()> {
        for module in catalog {
            self.register(module)?;
        }
        Ok(())
    }

    /// Scan `root/<kind>/<name>/module.toml` and register each enabled
    /// module from `catalog`.
    ///
    /// Returns the names registered. A missing root registers nothing.
    pub fn discover(&mut self, root: &Path, catalog: &Catalog) -> RegistryResult<Vec<String>> {
        let mut registered = Vec::new();
        for kind in ModuleKind::ALL {
            for path in find_manifests(&root.join(kind.dir_name()))? {
                let manifest = Manifest::load(&path)?;
                if !manifest.enabled {
                    tracing::debug!(module = %manifest.name, "module disabled by manifest");
                    continue;
                }
                let Some(template) = catalog.get(&manifest.name) else {
                    return Err(RegistryError::NotInCatalog {
                        name: manifest.name,
                        path,
                    });
                };
                if template.info.kind != kind {
                    return Err(RegistryError::KindMismatch {
                        name: manifest.name,
                        expected: kind.to_string(),
                        actual: template.info.kind.to_string(),
                    });
                }
                let mut module = template.clone();
                manifest.apply(&mut module.info, &path)?;
                self.register(module)?;
                registered.push(manifest.name);
            }
        }
        tracing::info!(root = %root.display(), count = registered.len(), "discovered modules");
        Ok(registered)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.get(name).cloned()
    }

    pub fn info(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(name).map(|m| &m.info)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Metadata of every module, sorted by name.
    pub fn modules(&self) -> Vec<&ModuleInfo> {
        self.modules.values().map(|m| &m.info).collect()
    }

    pub fn modules_of_kind(&self, kind: ModuleKind) -> Vec<&ModuleInfo> {
        self.modules
            .values()
            .map(|m| &m.info)
            .filter(|info| info.kind == kind)
            .collect()
    }

    pub fn documentation(&self, name: &str) -> Option<String> {
        self.info(name).map(ModuleInfo::documentation)
    }

    /// Order in which OID-owning sources are consulted: `collections` and
    /// `files` first, the rest by name.
    pub fn source_order(&self) -> Vec<String> {
        let mut order: Vec<String> = PRIORITY_SOURCES
            .iter()
            .filter(|name| self.info(name).is_some_and(ModuleInfo::owns_oids))
            .map(|name| name.to_string())
            .collect();
        for info in self.modules.values().map(|m| &m.info) {
            if info.owns_oids() && !PRIORITY_SOURCES.contains(&info.name.as_str()) {
                order.push(info.name.clone());
            }
        }
        order
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
