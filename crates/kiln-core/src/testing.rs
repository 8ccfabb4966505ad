//! Fixtures shared by the crate's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_options::{OptSpec, OptType, Options};
use kiln_registry::{
    Analyzer, Catalog, DispatchError, DispatchResult, Extractor, Host, MapReducer, Module,
    ModuleInfo, ModuleKind,
};
use kiln_store::{ArtifactKey, LockMode, LockObserver};
use kiln_types::{Oid, Value};
use tempfile::TempDir;

use crate::config::Config;
use crate::context::Context;
use crate::dispatcher::Dispatcher;

pub(crate) fn dispatcher(workers: usize) -> (TempDir, Dispatcher) {
    dispatcher_with(workers, |_| {})
}

pub(crate) fn dispatcher_with(
    workers: usize,
    configure: impl FnOnce(&mut Config),
) -> (TempDir, Dispatcher) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, workers);
    configure(&mut config);
    let ctx = Context::open(config, Catalog::new()).unwrap();
    (dir, Dispatcher::new(ctx).unwrap())
}

/// A dispatcher over `catalog`, reporting lock traffic to `observer`.
pub(crate) fn open_with(
    dir: &TempDir,
    workers: usize,
    catalog: Catalog,
    observer: Option<Arc<dyn LockObserver>>,
) -> Dispatcher {
    let mut builder = Context::builder(test_config(dir, workers)).catalog(catalog);
    if let Some(observer) = observer {
        builder = builder.observer(observer);
    }
    Dispatcher::new(builder.build().unwrap()).unwrap()
}

/// A dispatcher over `catalog` backed by the in-memory store. `dir` only
/// roots the configuration; nothing is written under it.
pub(crate) fn memory_with(dir: &TempDir, workers: usize, catalog: Catalog) -> Dispatcher {
    Dispatcher::new(Context::in_memory(test_config(dir, workers), catalog).unwrap()).unwrap()
}

fn test_config(dir: &TempDir, workers: usize) -> Config {
    let mut config = Config::with_root(dir.path());
    config.multiprocessing.workers = workers;
    config.general.lock_timeout_secs = 20;
    config
}

// ---------------------------------------------------------------------------
// Test modules
// ---------------------------------------------------------------------------

/// Counts its computations. Stores `{len, scale, note}` for each file.
pub(crate) struct Counting {
    pub name: &'static str,
    pub calls: Arc<AtomicUsize>,
}

impl Extractor for Counting {
    fn process(&self, host: &dyn Host, oid: &Oid, opts: &Options) -> DispatchResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(bytes) = host.file_bytes(oid)? else {
            return Ok(false);
        };
        std::thread::sleep(Duration::from_millis(2));
        if bytes.starts_with(b"bad") {
            return Ok(false);
        }
        if bytes.starts_with(b"boom") {
            return Err(DispatchError::module_failure(self.name, oid, "boom"));
        }
        let mut out = Value::map();
        out.insert("len", bytes.len());
        out.insert("scale", opts.get("scale").cloned().unwrap_or(Value::Int(1)));
        out.insert("note", opts.get("note").cloned().unwrap_or(Value::Null));
        host.store(self.name, oid, opts, out)?;
        Ok(true)
    }
}

pub(crate) fn counting_info(name: &str) -> ModuleInfo {
    ModuleInfo::new(name, ModuleKind::Extractor).with_opts(
        kiln_options::OptionSchema::new()
            .option("scale", OptSpec::new(OptType::Int, Value::Int(1)).mangle())
            .option("note", OptSpec::new(OptType::Str, Value::from(""))),
    )
}

/// Sums `len` of another extractor over the given files.
pub(crate) struct TotalLen {
    pub of: &'static str,
}

impl Analyzer for TotalLen {
    fn results(&self, host: &dyn Host, oids: &[Oid], _opts: &Options) -> DispatchResult<Value> {
        let mut total = 0i64;
        for oid in oids {
            if let Some(v) = host.retrieve_one(self.of, oid, &Options::new())? {
                total += v.get("len").and_then(Value::as_i64).unwrap_or(0);
            }
        }
        Ok(Value::Int(total))
    }
}

/// Sum of all bytes across a set of files.
pub(crate) struct ByteSum {
    pub mapped: Arc<AtomicUsize>,
}

impl MapReducer for ByteSum {
    fn mapper(&self, host: &dyn Host, oid: &Oid, _opts: &Options, _job: &Oid) -> DispatchResult<Value> {
        self.mapped.fetch_add(1, Ordering::SeqCst);
        let bytes = host.file_bytes(oid)?.unwrap_or_default();
        Ok(Value::Int(bytes.iter().map(|b| i64::from(*b)).sum()))
    }

    fn reducer(
        &self,
        _host: &dyn Host,
        partials: Vec<Value>,
        _opts: &Options,
        _job: &Oid,
    ) -> DispatchResult<Value> {
        Ok(Value::Int(partials.iter().filter_map(Value::as_i64).sum()))
    }
}

/// Catalog used by the dispatcher tests, with the shared call counters.
pub(crate) struct TestModules {
    pub catalog: Catalog,
    pub counting_calls: Arc<AtomicUsize>,
    pub atomic_calls: Arc<AtomicUsize>,
    pub mapped: Arc<AtomicUsize>,
}

pub(crate) fn test_modules() -> TestModules {
    let counting_calls = Arc::new(AtomicUsize::new(0));
    let atomic_calls = Arc::new(AtomicUsize::new(0));
    let mapped = Arc::new(AtomicUsize::new(0));
    let catalog = Catalog::new()
        .with(Module::extractor(
            counting_info("counting"),
            Counting {
                name: "counting",
                calls: counting_calls.clone(),
            },
        ))
        .with(Module::extractor(
            counting_info("atomic_counting").atomic(),
            Counting {
                name: "atomic_counting",
                calls: atomic_calls.clone(),
            },
        ))
        .with(Module::analyzer(
            ModuleInfo::new("total_len", ModuleKind::Analyzer),
            TotalLen { of: "counting" },
        ))
        .with(Module::map_reducer(
            ModuleInfo::new("byte_sum", ModuleKind::MapReducer),
            ByteSum {
                mapped: mapped.clone(),
            },
        ));
    TestModules {
        catalog,
        counting_calls,
        atomic_calls,
        mapped,
    }
}

// ---------------------------------------------------------------------------
// Lock audit
// ---------------------------------------------------------------------------

/// Records lock traffic and flags any moment a key has a writer alongside
/// another writer or a reader.
#[derive(Default)]
pub(crate) struct LockAudit {
    held: Mutex<HashMap<ArtifactKey, (usize, usize)>>,
    pub violations: AtomicUsize,
    pub writes: AtomicUsize,
}

impl LockObserver for LockAudit {
    fn acquired(&self, key: &ArtifactKey, mode: LockMode) {
        let mut held = self.held.lock().unwrap();
        let (writers, readers) = held.entry(key.clone()).or_default();
        match mode {
            LockMode::Write => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                if *writers > 0 || *readers > 0 {
                    self.violations.fetch_add(1, Ordering::SeqCst);
                }
                *writers += 1;
            }
            LockMode::Read => {
                if *writers > 0 {
                    self.violations.fetch_add(1, Ordering::SeqCst);
                }
                *readers += 1;
            }
        }
    }

    fn released(&self, key: &ArtifactKey, mode: LockMode) {
        let mut held = self.held.lock().unwrap();
        if let Some((writers, readers)) = held.get_mut(key) {
            match mode {
                LockMode::Write => *writers = writers.saturating_sub(1),
                LockMode::Read => *readers = readers.saturating_sub(1),
            }
        }
    }
}
