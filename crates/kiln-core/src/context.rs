use std::sync::Arc;

use kiln_registry::{Catalog, DispatchResult, Registry};
use kiln_store::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore, LockObserver};

use crate::config::Config;
use crate::sources::builtin_sources;

/// Everything a dispatcher operation needs: configuration, the artifact
/// store, and the module registry. Cheap to clone; nothing in it changes
/// after construction.
#[derive(Clone)]
pub struct Context {
    config: Arc<Config>,
    store: Arc<dyn ArtifactStore>,
    fs_store: Option<Arc<FsArtifactStore>>,
    registry: Arc<Registry>,
}

impl Context {
    /// Assemble a context from parts.
    pub fn new(config: Config, store: Arc<dyn ArtifactStore>, registry: Registry) -> Self {
        Self {
            config: Arc::new(config),
            store,
            fs_store: None,
            registry: Arc::new(registry),
        }
    }

    /// Open the on-disk store under `config.db_dir()` and build the registry
    /// from `catalog`.
    pub fn open(config: Config, catalog: Catalog) -> DispatchResult<Self> {
        ContextBuilder::new(config).catalog(catalog).build()
    }

    /// A context over a fresh in-memory store. Nothing is written to disk
    /// and every artifact is lost when the last clone is dropped.
    pub fn in_memory(config: Config, catalog: Catalog) -> DispatchResult<Self> {
        let registry = build_registry(&config, catalog)?;
        let store = InMemoryArtifactStore::new().with_lock_timeout(config.lock_timeout());
        Ok(Self::new(config, Arc::new(store), registry))
    }

    pub fn builder(config: Config) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    /// The filesystem store, when the context was opened on disk.
    pub fn fs_store(&self) -> Option<&Arc<FsArtifactStore>> {
        self.fs_store.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Release locks and temporary files on SIGINT/SIGTERM.
    pub fn install_cleanup_handler(&self) -> std::io::Result<()> {
        match &self.fs_store {
            Some(store) => kiln_store::install_cleanup_handler(Arc::clone(store)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("root", &self.config.dirs.root)
            .field("modules", &self.registry.len())
            .finish()
    }
}

/// Builds a [`Context`] backed by the filesystem store.
pub struct ContextBuilder {
    config: Config,
    catalog: Catalog,
    observer: Option<Arc<dyn LockObserver>>,
}

impl ContextBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            catalog: Catalog::new(),
            observer: None,
        }
    }

    /// Compiled-in modules available to discovery.
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Report lock traffic to `observer`.
    pub fn observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> DispatchResult<Context> {
        let registry = build_registry(&self.config, self.catalog)?;
        let mut store =
            FsArtifactStore::open(self.config.db_dir())?.with_lock_timeout(self.config.lock_timeout());
        if let Some(observer) = self.observer {
            store = store.with_observer(observer);
        }
        std::fs::create_dir_all(self.config.scratch_dir())
            .map_err(|e| kiln_registry::DispatchError::StoreIo(e.to_string()))?;

        let store = Arc::new(store);
        tracing::info!(
            db = %self.config.db_dir().display(),
            modules = registry.len(),
            "context opened"
        );
        Ok(Context {
            config: Arc::new(self.config),
            store: store.clone(),
            fs_store: Some(store),
            registry: Arc::new(registry),
        })
    }
}

/// Built-in sources plus the catalog modules enabled for this configuration.
///
/// When the modules directory exists, only modules with a manifest there are
/// enabled; otherwise the whole catalog is. In dev mode the dev directory is
/// scanned as well.
pub fn build_registry(config: &Config, catalog: Catalog) -> DispatchResult<Registry> {
    let mut registry = Registry::new();
    registry.register_all(builtin_sources())?;

    let modules_dir = config.modules_dir();
    if modules_dir.is_dir() {
        registry.discover(&modules_dir, &catalog)?;
    } else {
        registry.register_all(catalog.clone())?;
    }
    if config.general.dev_mode {
        let dev_dir = config.dev_modules_dir();
        registry.discover(&dev_dir, &catalog)?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FILES, TAGS};
    use kiln_registry::{DispatchError, MANIFEST_FILE};

    #[test]
    fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let ctx = Context::open(config.clone(), Catalog::new()).unwrap();
        assert!(config.db_dir().is_dir());
        assert!(config.scratch_dir().is_dir());
        assert!(ctx.registry().contains(FILES));
        assert!(ctx.registry().contains(TAGS));
        assert!(ctx.fs_store().is_some());
    }

    #[test]
    fn in_memory_context_touches_no_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path().join("unused"));
        let ctx = Context::in_memory(config.clone(), Catalog::new()).unwrap();
        assert!(ctx.fs_store().is_none());
        assert!(ctx.registry().contains(FILES));
        assert!(ctx.install_cleanup_handler().is_ok());
        assert!(!config.dirs.root.exists());
    }

    #[test]
    fn dev_dir_conflicts_surface_as_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path());
        config.general.dev_mode = true;
        let manifest_dir = config.dev_modules_dir().join("sources").join("ghost");
        std::fs::create_dir_all(&manifest_dir).unwrap();
        std::fs::write(manifest_dir.join(MANIFEST_FILE), "name = \"ghost\"").unwrap();
        let err = Context::open(config, Catalog::new()).unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }
}
