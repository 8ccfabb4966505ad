//! Lazy, cached evaluation of modules over OIDs.
//!
//! Every operation resolves the module first, so an unknown name fails
//! before the store is touched. Lookups validate only mangle options;
//! computation validates the full option set. Extractor artifacts are
//! computed under the key's write lock after a second existence check, so
//! concurrent callers asking for the same artifact compute it once and all
//! observe the committed value.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_options::Options;
use kiln_registry::{
    DispatchError, DispatchResult, Extractor, Host, MapReducer, Module, ModuleBody, ModuleInfo,
    ModuleKind,
};
use kiln_store::{ArtifactKey, ArtifactStore, LockMode};
use kiln_types::{Oid, Value};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::pool::WorkerPool;
use crate::progress::Progress;
use crate::sources::COLLECTIONS;

// ---------------------------------------------------------------------------
// BatchReport
// ---------------------------------------------------------------------------

/// A failure confined to one OID of a batch.
#[derive(Debug)]
pub struct OidFailure {
    pub oid: Oid,
    pub error: DispatchError,
}

/// Per-OID outcome of a `process` call.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub module: String,
    /// OIDs after normalization (the job id for map-reducers).
    pub oids: Vec<Oid>,
    pub cached: usize,
    pub computed: usize,
    pub failures: Vec<OidFailure>,
}

impl BatchReport {
    fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure(&self, oid: &Oid) -> Option<&DispatchError> {
        self.failures.iter().find(|f| &f.oid == oid).map(|f| &f.error)
    }

    fn record(&mut self, oid: Oid, outcome: DispatchResult<Outcome>) -> DispatchResult<()> {
        match outcome {
            Ok(Outcome::Cached) => self.cached += 1,
            Ok(Outcome::Computed) => self.computed += 1,
            Err(error) if error.is_per_oid() => {
                warn!(module = %self.module, %oid, %error, "failed");
                self.failures.push(OidFailure { oid, error });
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Cached,
    Computed,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// The evaluation engine. Clones share the same store, registry and pool.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Context,
    pool: Arc<WorkerPool>,
    progress: Arc<Progress>,
}

impl Dispatcher {
    pub fn new(ctx: Context) -> DispatchResult<Self> {
        let pool = WorkerPool::new(ctx.config().worker_count())?;
        Ok(Self {
            ctx,
            pool: Arc::new(pool),
            progress: Arc::new(Progress::new()),
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    pub(crate) fn store_ref(&self) -> &dyn ArtifactStore {
        self.ctx.store()
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn module(&self, name: &str) -> DispatchResult<Arc<Module>> {
        self.ctx
            .registry()
            .get(name)
            .ok_or_else(|| DispatchError::UnknownModule(name.to_string()))
    }

    /// Storage key for `oid` under `info` with the mangle subset of `opts`.
    pub(crate) fn key_for(
        &self,
        info: &ModuleInfo,
        oid: &Oid,
        opts: &Options,
    ) -> DispatchResult<ArtifactKey> {
        let mangle = info.opts.validate_mangle(opts)?;
        let fingerprint = info.opts.fingerprint(&mangle)?;
        Ok(ArtifactKey::new(info.name.clone(), *oid, fingerprint))
    }

    // -- lookups --------------------------------------------------------

    /// Whether `module` has an artifact for `oid` under `opts`.
    pub fn exists(&self, module: &str, oid: &Oid, opts: &Options) -> DispatchResult<bool> {
        let module = self.module(module)?;
        if module.info.kind == ModuleKind::Analyzer {
            return Ok(false);
        }
        let key = self.key_for(&module.info, oid, opts)?;
        Ok(self.store_ref().exists(&key)?)
    }

    /// The source module that owns `oid`, probing sources in registry order.
    pub fn source_of(&self, oid: &Oid) -> DispatchResult<Option<String>> {
        for name in self.ctx.registry().source_order() {
            if self.store_ref().exists(&ArtifactKey::plain(name.clone(), *oid))? {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Read a stored artifact without computing it.
    pub fn load(&self, module: &str, oid: &Oid, opts: &Options) -> DispatchResult<Option<Value>> {
        let module = self.module(module)?;
        let key = self.key_for(&module.info, oid, opts)?;
        Ok(self.store_ref().read(&key)?)
    }

    /// Persist an artifact for `module`.
    pub fn store(&self, module: &str, oid: &Oid, opts: &Options, value: &Value) -> DispatchResult<()> {
        let module = self.module(module)?;
        let key = self.key_for(&module.info, oid, opts)?;
        self.store_ref().write(&key, value)?;
        Ok(())
    }

    // -- normalization --------------------------------------------------

    /// Turn a caller's OID list into the list `module` is evaluated over.
    ///
    /// Sources take the list as is. Atomic modules refuse any set-valued or
    /// unknown OID. Other non-set modules expand collections one level.
    /// Every OID handed to a non-source must have a known source.
    pub fn normalize(&self, info: &ModuleInfo, oids: &[Oid]) -> DispatchResult<Vec<Oid>> {
        if info.kind == ModuleKind::Source {
            return Ok(oids.to_vec());
        }
        let mut out = Vec::with_capacity(oids.len());
        for oid in oids {
            let Some(source) = self.source_of(oid)? else {
                return Err(DispatchError::bad_oid_list(
                    &info.name,
                    format!("{oid} has no known source"),
                ));
            };
            let set_valued = self
                .ctx
                .registry()
                .info(&source)
                .is_some_and(|s| s.set);
            if !set_valued || info.set {
                out.push(*oid);
            } else if info.atomic {
                return Err(DispatchError::bad_oid_list(
                    &info.name,
                    format!("atomic module refuses {source} OID {oid}"),
                ));
            } else if source == COLLECTIONS {
                out.extend(self.collection_members(oid)?.unwrap_or_default());
            } else {
                return Err(DispatchError::bad_oid_list(
                    &info.name,
                    format!("cannot expand {source} OID {oid}"),
                ));
            }
        }
        let mut seen = std::collections::HashSet::with_capacity(out.len());
        out.retain(|oid| seen.insert(*oid));
        Ok(out)
    }

    // -- process ----------------------------------------------------------

    /// Ensure artifacts exist for every OID; `true` when nothing failed.
    pub fn process(&self, module: &str, oids: &[Oid], opts: &Options, force: bool) -> DispatchResult<bool> {
        Ok(self.process_report(module, oids, opts, force)?.is_success())
    }

    /// [`process`](Self::process) with the per-OID outcome.
    pub fn process_report(
        &self,
        module: &str,
        oids: &[Oid],
        opts: &Options,
        force: bool,
    ) -> DispatchResult<BatchReport> {
        let module = self.module(module)?;
        let info = &module.info;
        let mut report = BatchReport::new(&info.name);
        let oids = self.normalize(info, oids)?;

        match &module.body {
            ModuleBody::Analyzer(body) => {
                let validated = info.opts.validate(opts)?;
                body.results(self, &oids, &validated)?;
                report.computed = oids.len();
            }
            ModuleBody::MapReducer(body) => {
                let job = Oid::from_members(&oids);
                let outcome = self.run_job(info, body.as_ref(), &oids, &job, opts, force);
                report.record(job, outcome)?;
                report.oids = vec![job];
                return Ok(report);
            }
            ModuleBody::Source(body) => {
                let missing = self.misses(info, &oids, opts, force)?;
                report.cached = oids.len() - missing.len();
                if !missing.is_empty() {
                    let validated = info.opts.validate(opts)?;
                    if body.process(self, &missing, &validated)? {
                        report.computed = missing.len();
                    } else {
                        for oid in missing {
                            report.failures.push(OidFailure {
                                oid,
                                error: DispatchError::module_failure(&info.name, oid, "not available"),
                            });
                        }
                    }
                }
            }
            ModuleBody::Extractor(body) => {
                let missing = self.misses(info, &oids, opts, force)?;
                report.cached = oids.len() - missing.len();
                if !missing.is_empty() {
                    let validated = info.opts.validate(opts)?;
                    self.progress.add_total(missing.len());
                    let outcomes = self.pool.map(&missing, |oid| {
                        let outcome = self.compute_one(info, body.as_ref(), oid, &validated, force);
                        self.progress.tick(outcome.is_ok());
                        outcome
                    });
                    for (oid, outcome) in missing.into_iter().zip(outcomes) {
                        report.record(oid, outcome)?;
                    }
                }
            }
        }

        report.oids = oids;
        debug!(
            module = %report.module,
            cached = report.cached,
            computed = report.computed,
            failed = report.failures.len(),
            "process finished"
        );
        Ok(report)
    }

    /// OIDs without an artifact (all of them when forced).
    fn misses(&self, info: &ModuleInfo, oids: &[Oid], opts: &Options, force: bool) -> DispatchResult<Vec<Oid>> {
        if force {
            return Ok(oids.to_vec());
        }
        let mut missing = Vec::new();
        for oid in oids {
            let key = self.key_for(info, oid, opts)?;
            if self.store_ref().exists(&key)? {
                debug!(%key, "cache hit");
            } else {
                missing.push(*oid);
            }
        }
        Ok(missing)
    }

    fn compute_one(
        &self,
        info: &ModuleInfo,
        body: &dyn Extractor,
        oid: &Oid,
        opts: &Options,
        force: bool,
    ) -> DispatchResult<Outcome> {
        let key = self.key_for(info, oid, opts)?;
        let guard = self.store_ref().lock(&key, LockMode::Write)?;
        if !force && self.store_ref().exists(&key)? {
            debug!(%key, "computed by another worker");
            return Ok(Outcome::Cached);
        }
        debug!(%key, "cache miss; computing");
        let ok = body.process(self, oid, opts)?;
        guard.release()?;
        if ok {
            Ok(Outcome::Computed)
        } else {
            Err(DispatchError::module_failure(&info.name, oid, "process returned false"))
        }
    }

    fn run_job(
        &self,
        info: &ModuleInfo,
        body: &dyn MapReducer,
        oids: &[Oid],
        job: &Oid,
        opts: &Options,
        force: bool,
    ) -> DispatchResult<Outcome> {
        let key = self.key_for(info, job, opts)?;
        if !force && self.store_ref().exists(&key)? {
            debug!(%key, "cache hit");
            return Ok(Outcome::Cached);
        }
        let validated = info.opts.validate(opts)?;
        let guard = self.store_ref().lock(&key, LockMode::Write)?;
        if !force && self.store_ref().exists(&key)? {
            return Ok(Outcome::Cached);
        }

        self.progress.add_total(oids.len());
        let mapped = self.pool.map(oids, |oid| {
            let partial = body.mapper(self, oid, &validated, job);
            self.progress.tick(partial.is_ok());
            partial
        });
        let mut partials = Vec::with_capacity(mapped.len());
        for (oid, partial) in oids.iter().zip(mapped) {
            match partial {
                Ok(value) => partials.push(value),
                Err(e) if e.is_per_oid() => {
                    return Err(DispatchError::module_failure(
                        &info.name,
                        job,
                        format!("mapper failed on {oid}: {e}"),
                    ))
                }
                Err(e) => return Err(e),
            }
        }

        let value = body.reducer(self, partials, &validated, job)?;
        self.store_ref().write(&key, &value)?;
        guard.release()?;
        info!(module = %info.name, %job, members = oids.len(), "job reduced");
        Ok(Outcome::Computed)
    }

    // -- retrieve ---------------------------------------------------------

    /// Results of `module` for `oids`, computing misses first.
    ///
    /// A single OID that normalizes to itself yields its value directly;
    /// otherwise the result is a map from OID hex to value that omits OIDs
    /// with no result. Analyzer results and map-reduce outputs are single
    /// values. With `lock`, read-back happens under a reader lock.
    pub fn retrieve(
        &self,
        module: &str,
        oids: &[Oid],
        opts: &Options,
        lock: bool,
    ) -> DispatchResult<Option<Value>> {
        let module = self.module(module)?;
        let info = &module.info;

        if let ModuleBody::Analyzer(body) = &module.body {
            let oids = self.normalize(info, oids)?;
            let validated = info.opts.validate(opts)?;
            return body.results(self, &oids, &validated).map(Some);
        }

        let report = self.process_report(&info.name, oids, opts, false)?;

        if info.kind == ModuleKind::MapReducer {
            let job = report.oids[0];
            if let Some(error) = take_failure(report, &job) {
                return Err(error);
            }
            return self.read_back(&module, &job, opts, lock);
        }

        let single = oids.len() == 1 && report.oids.as_slice() == oids;
        if single {
            let oid = oids[0];
            if info.kind == ModuleKind::Extractor {
                if let Some(error) = take_failure(report, &oid) {
                    return Err(error);
                }
            }
            return self.read_back(&module, &oid, opts, lock);
        }

        let mut out = BTreeMap::new();
        for oid in &report.oids {
            if report.failure(oid).is_some() {
                continue;
            }
            if let Some(value) = self.read_back(&module, oid, opts, lock)? {
                out.insert(oid.to_hex(), value);
            }
        }
        Ok(Some(Value::Map(out)))
    }

    /// Read an artifact, recomputing an extractor artifact once if the
    /// stored bytes turn out to be unreadable.
    fn read_back(&self, module: &Module, oid: &Oid, opts: &Options, lock: bool) -> DispatchResult<Option<Value>> {
        let key = self.key_for(&module.info, oid, opts)?;
        let read = |key: &ArtifactKey| -> DispatchResult<Option<Value>> {
            if lock {
                Ok(self.store_ref().read_locked(key)?)
            } else {
                Ok(self.store_ref().read(key)?)
            }
        };
        let value = read(&key)?;
        if value.is_none()
            && module.info.kind == ModuleKind::Extractor
            && self.store_ref().exists(&key)?
        {
            warn!(%key, "unreadable artifact; recomputing");
            let report = self.process_report(&module.info.name, std::slice::from_ref(oid), opts, true)?;
            if let Some(error) = take_failure(report, oid) {
                return Err(error);
            }
            return read(&key);
        }
        Ok(value)
    }

    /// `retrieve` for one OID, then index into the resulting map.
    pub fn get_field(
        &self,
        module: &str,
        oid: &Oid,
        field: &str,
        opts: &Options,
    ) -> DispatchResult<Option<Value>> {
        let value = self.retrieve(module, std::slice::from_ref(oid), opts, false)?;
        Ok(value.and_then(|v| v.get(field).cloned()))
    }

    // -- flush ------------------------------------------------------------

    /// Delete one artifact.
    pub fn flush_artifact(&self, module: &str, oid: &Oid, opts: &Options) -> DispatchResult<bool> {
        let module = self.module(module)?;
        let key = self.key_for(&module.info, oid, opts)?;
        let removed = self.store_ref().delete(&key)?;
        info!(%key, removed, "artifact flushed");
        Ok(removed)
    }

    /// Delete every artifact of `module`.
    pub fn flush_module(&self, module: &str) -> DispatchResult<usize> {
        let module = self.module(module)?;
        let removed = self.store_ref().flush_module(&module.info.name)?;
        info!(module = %module.info.name, removed, "module flushed");
        Ok(removed)
    }

    /// Remove `oid` everywhere: its artifacts in every module, and its
    /// membership in every collection. Collections left empty are deleted.
    pub fn flush_oid(&self, oid: &Oid) -> DispatchResult<FlushReport> {
        let mut report = FlushReport::default();
        for cid in self.collections_containing(oid)? {
            match self.prune_collection_by_id(&cid, std::slice::from_ref(oid))? {
                Some(new_cid) => report.recreated.push((cid, new_cid)),
                None => report.deleted_collections.push(cid),
            }
        }

        let mut modules: Vec<String> = self.store_ref().modules()?;
        for info in self.ctx.registry().modules() {
            if !modules.contains(&info.name) {
                modules.push(info.name.clone());
            }
        }
        for module in modules {
            report.artifacts += self.store_ref().delete_oid(&module, oid)?;
        }
        info!(
            %oid,
            artifacts = report.artifacts,
            collections = report.recreated.len() + report.deleted_collections.len(),
            "oid flushed"
        );
        Ok(report)
    }
}

/// What a [`Dispatcher::flush_oid`] removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub artifacts: usize,
    /// `(old, new)` ids of collections re-created without the OID.
    pub recreated: Vec<(Oid, Oid)>,
    /// Collections deleted because the OID was their last member.
    pub deleted_collections: Vec<Oid>,
}

fn take_failure(report: BatchReport, oid: &Oid) -> Option<DispatchError> {
    report
        .failures
        .into_iter()
        .find(|f| &f.oid == oid)
        .map(|f| f.error)
}

impl Host for Dispatcher {
    fn retrieve(&self, module: &str, oids: &[Oid], opts: &Options) -> DispatchResult<Option<Value>> {
        Dispatcher::retrieve(self, module, oids, opts, false)
    }

    fn store(&self, module: &str, oid: &Oid, opts: &Options, value: Value) -> DispatchResult<()> {
        Dispatcher::store(self, module, oid, opts, &value)
    }

    fn load(&self, module: &str, oid: &Oid, opts: &Options) -> DispatchResult<Option<Value>> {
        Dispatcher::load(self, module, oid, opts)
    }

    fn source_of(&self, oid: &Oid) -> DispatchResult<Option<String>> {
        Dispatcher::source_of(self, oid)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ctx", &self.ctx)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;

    use crate::sources::{FILES, FILE_META};
    use crate::testing::{dispatcher, memory_with, open_with, test_modules, LockAudit};
    use kiln_store::LockObserver;
    use proptest::prelude::*;
    use walkdir::WalkDir;

    fn opts(pairs: &[(&str, Value)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn import_n(d: &Dispatcher, n: usize) -> Vec<Oid> {
        (0..n)
            .map(|i| d.import_bytes(&format!("f{i}"), format!("content {i}").as_bytes()).unwrap())
            .collect()
    }

    fn snapshot(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut paths: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .map(|e| e.into_path())
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn unknown_module_touches_nothing() {
        let (dir, d) = dispatcher(2);
        let oid = d.import_bytes("a", b"a").unwrap();
        let before = snapshot(dir.path());
        let err = d.process("no_such_module", &[oid], &Options::new(), false).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownModule(ref m) if m == "no_such_module"));
        assert!(matches!(
            d.retrieve("no_such_module", &[oid], &Options::new(), true),
            Err(DispatchError::UnknownModule(_))
        ));
        assert!(d.flush_module("no_such_module").is_err());
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn second_process_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = open_with(&dir, 1, t.catalog, None);
        let oids = import_n(&d, 3);

        let first = d.process_report("counting", &oids, &Options::new(), false).unwrap();
        assert_eq!((first.cached, first.computed), (0, 3));
        let second = d.process_report("counting", &oids, &Options::new(), false).unwrap();
        assert_eq!((second.cached, second.computed), (3, 0));
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 3);

        let forced = d.process_report("counting", &oids[..1], &Options::new(), true).unwrap();
        assert_eq!(forced.computed, 1);
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retrieve_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let d = open_with(&dir, 1, test_modules().catalog, None);
        let oids = import_n(&d, 2);

        let single = d.retrieve("counting", &oids[..1], &Options::new(), false).unwrap().unwrap();
        assert_eq!(single.get("len"), Some(&Value::Int(9)));

        let many = d.retrieve("counting", &oids, &Options::new(), false).unwrap().unwrap();
        let map = many.as_map().unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&oids[1].to_hex()));

        let cid = d.create_collection("pair", &oids, "").unwrap();
        let expanded = d.retrieve("counting", &[cid], &Options::new(), true).unwrap().unwrap();
        assert_eq!(expanded.as_map().unwrap().len(), 2);
    }

    #[test]
    fn non_mangle_options_share_an_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = open_with(&dir, 1, t.catalog, None);
        let oid = import_n(&d, 1)[0];

        d.process("counting", &[oid], &opts(&[("note", Value::from("first"))]), false).unwrap();
        d.process("counting", &[oid], &opts(&[("note", Value::from("second"))]), false).unwrap();
        d.process("counting", &[oid], &opts(&[("scale", Value::Int(1))]), false).unwrap();
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.store_ref().list_keys("counting").unwrap().len(), 1);

        d.process("counting", &[oid], &opts(&[("scale", Value::Int(3))]), false).unwrap();
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 2);
        let keys = d.store_ref().list_keys("counting").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.fingerprint.is_empty()));

        let scaled = d
            .get_field("counting", &oid, "scale", &opts(&[("scale", Value::from("3"))]))
            .unwrap();
        assert_eq!(scaled, Some(Value::Int(3)));
    }

    #[test]
    fn bad_options_are_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let d = open_with(&dir, 1, test_modules().catalog, None);
        let oid = import_n(&d, 1)[0];
        assert!(matches!(
            d.process("counting", &[oid], &opts(&[("bogus", Value::Int(1))]), false),
            Err(DispatchError::BadInput(_))
        ));
        assert!(matches!(
            d.process("counting", &[oid], &opts(&[("scale", Value::from("many"))]), false),
            Err(DispatchError::BadInput(_))
        ));
    }

    #[test]
    fn atomic_module_refuses_collections() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = open_with(&dir, 1, t.catalog, None);
        let oids = import_n(&d, 2);
        let cid = d.create_collection("c", &oids, "").unwrap();

        let err = d.process("atomic_counting", &[cid], &Options::new(), false).unwrap_err();
        assert!(matches!(err, DispatchError::BadOidList { .. }));
        assert_eq!(t.atomic_calls.load(Ordering::SeqCst), 0);
        assert!(d.process("atomic_counting", &oids, &Options::new(), false).unwrap());
    }

    #[test]
    fn unknown_oid_is_a_bad_oid_list() {
        let dir = tempfile::tempdir().unwrap();
        let d = open_with(&dir, 1, test_modules().catalog, None);
        let ghost = Oid::from_bytes(b"not imported");
        assert!(matches!(
            d.process("counting", &[ghost], &Options::new(), false),
            Err(DispatchError::BadOidList { .. })
        ));
    }

    #[test]
    fn module_failures_stay_per_oid() {
        let dir = tempfile::tempdir().unwrap();
        let d = open_with(&dir, 2, test_modules().catalog, None);
        let good = d.import_bytes("good", b"fine").unwrap();
        let bad = d.import_bytes("bad", b"bad input").unwrap();
        let boom = d.import_bytes("boom", b"boom!").unwrap();

        let report = d.process_report("counting", &[good, bad, boom], &Options::new(), false).unwrap();
        assert_eq!(report.computed, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failure(&bad), Some(DispatchError::ModuleFailure { .. })));
        assert!(d.exists("counting", &good, &Options::new()).unwrap());
        assert!(!d.exists("counting", &bad, &Options::new()).unwrap());

        let all = d.retrieve("counting", &[good, bad, boom], &Options::new(), false).unwrap().unwrap();
        assert_eq!(all.as_map().unwrap().len(), 1);
        assert!(matches!(
            d.retrieve("counting", &[bad], &Options::new(), false),
            Err(DispatchError::ModuleFailure { .. })
        ));
    }

    #[test]
    fn analyzer_results_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let d = open_with(&dir, 1, test_modules().catalog, None);
        let oids = import_n(&d, 3);
        let cid = d.create_collection("all", &oids, "").unwrap();

        let total = d.retrieve("total_len", &[cid], &Options::new(), false).unwrap();
        assert_eq!(total, Some(Value::Int(27)));
        assert!(!d.exists("total_len", &cid, &Options::new()).unwrap());
        assert!(d.store_ref().list_keys("total_len").unwrap().is_empty());
        assert!(d.exists("counting", &oids[2], &Options::new()).unwrap());
    }

    #[test]
    fn map_reduce_is_cached_under_the_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = open_with(&dir, 3, t.catalog, None);
        let a = d.import_bytes("a", &[1, 2, 3]).unwrap();
        let b = d.import_bytes("b", &[10, 20]).unwrap();
        let cid = d.create_collection("ab", &[a, b], "").unwrap();

        let sum = d.retrieve("byte_sum", &[cid], &Options::new(), false).unwrap();
        assert_eq!(sum, Some(Value::Int(36)));
        assert_eq!(t.mapped.load(Ordering::SeqCst), 2);
        assert!(d.exists("byte_sum", &cid, &Options::new()).unwrap());

        let again = d.retrieve("byte_sum", &[b, a], &Options::new(), false).unwrap();
        assert_eq!(again, sum);
        assert_eq!(t.mapped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn corrupt_artifact_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = open_with(&dir, 1, t.catalog, None);
        let oid = import_n(&d, 1)[0];
        let expected = d.retrieve("counting", &[oid], &Options::new(), false).unwrap();

        let key = ArtifactKey::plain("counting", oid);
        let path = d.context().fs_store().unwrap().artifact_path(&key).unwrap();
        std::fs::write(&path, b"KLNZ\x00\x00\x00\x00torn write").unwrap();

        let value = d.retrieve("counting", &[oid], &Options::new(), false).unwrap();
        assert_eq!(value, expected);
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flushed_artifact_recomputes_to_the_same_value() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = open_with(&dir, 2, t.catalog, None);
        let oids = import_n(&d, 5);
        let before = d.retrieve("counting", &oids, &Options::new(), false).unwrap();

        assert!(d.flush_artifact("counting", &oids[2], &Options::new()).unwrap());
        let report = d.process_report("counting", &oids, &Options::new(), false).unwrap();
        assert_eq!((report.cached, report.computed), (4, 1));
        assert_eq!(d.retrieve("counting", &oids, &Options::new(), false).unwrap(), before);
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn flush_module_then_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = open_with(&dir, 1, t.catalog, None);
        let oids = import_n(&d, 3);
        d.process("counting", &oids, &Options::new(), false).unwrap();
        assert_eq!(d.flush_module("counting").unwrap(), 3);
        assert!(!d.exists("counting", &oids[0], &Options::new()).unwrap());
        d.process("counting", &oids, &Options::new(), false).unwrap();
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn flush_oid_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let d = open_with(&dir, 1, test_modules().catalog, None);
        let oids = import_n(&d, 3);
        d.process("counting", &oids, &opts(&[("scale", Value::Int(2))]), false).unwrap();
        d.process("counting", &oids, &Options::new(), false).unwrap();
        let both = d.create_collection("both", &oids[..2], "").unwrap();
        let solo = d.create_collection("solo", &oids[..1], "").unwrap();
        let other = d.create_collection("other", &oids[1..], "").unwrap();
        let pair = d.create_collection("pair", &[oids[0], oids[2]], "").unwrap();
        let just_2 = d.create_collection("just_2", &oids[2..], "").unwrap();

        let x = oids[0];
        let report = d.flush_oid(&x).unwrap();
        for module in ["counting", FILES, FILE_META] {
            assert!(!d.exists(module, &x, &Options::new()).unwrap(), "{module}");
        }
        assert!(!d.exists("counting", &x, &opts(&[("scale", Value::Int(2))])).unwrap());
        assert!(d.exists("counting", &oids[1], &Options::new()).unwrap());
        assert_eq!(d.source_of(&x).unwrap(), None);

        assert_eq!(report.deleted_collections, vec![solo]);
        assert_eq!(report.recreated.len(), 2);
        let new = report
            .recreated
            .iter()
            .find(|(old, _)| *old == both)
            .map(|(_, new)| *new)
            .unwrap();
        assert_eq!(d.collection_members(&new).unwrap(), Some(vec![oids[1]]));
        assert_eq!(d.collection_by_name("both").unwrap(), Some(new));
        assert_eq!(d.collection_by_name("other").unwrap(), Some(other));

        // {x, o2} without x is exactly "just_2", so "pair" folds into it.
        assert!(report.recreated.contains(&(pair, just_2)));
        assert_eq!(d.collection_by_name("pair").unwrap(), None);
        assert_eq!(d.collection_by_name("just_2").unwrap(), Some(just_2));
        assert!(d.collections_containing(&x).unwrap().is_empty());
    }

    #[test]
    fn concurrent_process_computes_each_artifact_once() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let audit = Arc::new(LockAudit::default());
        let observer: Arc<dyn LockObserver> = audit.clone();
        let d = open_with(&dir, 4, t.catalog, Some(observer));
        let oids = import_n(&d, 24);
        let cid = d.create_collection("batch", &oids, "").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let d = d.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        d.process("counting", &[cid], &Options::new(), false).map(|_| ())
                    } else {
                        d.retrieve("counting", &[cid], &Options::new(), true).map(|_| ())
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(t.counting_calls.load(Ordering::SeqCst), oids.len());
        assert_eq!(audit.violations.load(Ordering::SeqCst), 0);
        assert!(audit.writes.load(Ordering::SeqCst) >= oids.len());
        let values = d.retrieve("counting", &[cid], &Options::new(), false).unwrap().unwrap();
        assert_eq!(values.as_map().unwrap().len(), oids.len());
    }

    #[test]
    fn in_memory_store_computes_each_artifact_once() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = memory_with(&dir, 4, t.catalog);
        let oids = import_n(&d, 16);
        let cid = d.create_collection("batch", &oids, "").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let d = d.clone();
                thread::spawn(move || d.retrieve("counting", &[cid], &Options::new(), true))
            })
            .collect();
        for h in handles {
            let values = h.join().unwrap().unwrap().unwrap();
            assert_eq!(values.as_map().unwrap().len(), oids.len());
        }
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), oids.len());
        assert!(snapshot(dir.path()).iter().all(|p| p == dir.path()));

        let report = d.flush_oid(&oids[0]).unwrap();
        assert!(report.artifacts >= 3);
        assert!(!d.exists("counting", &oids[0], &Options::new()).unwrap());
        assert_eq!(d.source_of(&oids[0]).unwrap(), None);
        assert_eq!(report.recreated.len(), 1);
    }

    #[test]
    fn in_memory_flush_module_and_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_modules();
        let d = memory_with(&dir, 1, t.catalog);
        let oid = import_n(&d, 1)[0];
        let first = d.retrieve("counting", &[oid], &Options::new(), false).unwrap();
        assert_eq!(d.flush_module("counting").unwrap(), 1);
        let again = d.retrieve("counting", &[oid], &Options::new(), false).unwrap();
        assert_eq!(first, again);
        assert_eq!(t.counting_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn readers_do_not_block_readers() {
        let dir = tempfile::tempdir().unwrap();
        let d = open_with(&dir, 1, test_modules().catalog, None);
        let oid = import_n(&d, 1)[0];
        let expected = d.retrieve("counting", &[oid], &Options::new(), false).unwrap();

        let key = ArtifactKey::plain("counting", oid);
        let held = d.store_ref().lock(&key, LockMode::Read).unwrap();
        let reader = {
            let d = d.clone();
            thread::spawn(move || d.retrieve("counting", &[oid], &Options::new(), true))
        };
        let value = reader.join().unwrap().unwrap();
        held.release().unwrap();
        assert_eq!(value, expected);
    }

    #[test]
    fn source_retrieve_reports_missing_oids() {
        let (_dir, d) = dispatcher(1);
        let ghost = Oid::from_bytes(b"ghost");
        let report = d.process_report(FILES, &[ghost], &Options::new(), false).unwrap();
        assert!(!report.is_success());
        assert_eq!(d.retrieve(FILES, &[ghost], &Options::new(), false).unwrap(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn note_never_changes_the_artifact_path(a in "[a-z]{0,12}", b in "[a-z]{0,12}") {
            let dir = tempfile::tempdir().unwrap();
            let d = open_with(&dir, 1, test_modules().catalog, None);
            let info = d.module("counting").unwrap().info.clone();
            let oid = Oid::from_bytes(b"any");
            let ka = d.key_for(&info, &oid, &opts(&[("note", Value::from(a.as_str()))])).unwrap();
            let kb = d.key_for(&info, &oid, &opts(&[("note", Value::from(b.as_str())), ("scale", Value::Int(1))])).unwrap();
            prop_assert_eq!(ka, kb);
        }
    }
}
