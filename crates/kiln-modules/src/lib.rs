//! Analysis modules compiled into kiln.
//!
//! Each module is a unit struct implementing one capability trait, with an
//! `info()` constructor for its metadata. [`catalog`] collects them all; the
//! registry enables them wholesale or by manifest discovery.
//!
//! | Module | Kind | Output |
//! |--------|------|--------|
//! | `byte_histogram` | extractor | 256 byte counters per file |
//! | `entropy` | extractor | Shannon entropy, optionally per block |
//! | `size_summary` | analyzer | size statistics over a set of files |
//! | `byte_frequency` | map-reducer | byte counters summed over a set, ranked |

pub mod analyzers;
pub mod extractors;
pub mod map_reducers;

use kiln_registry::{Catalog, Module};

pub use analyzers::SizeSummary;
pub use extractors::{ByteHistogram, Entropy};
pub use map_reducers::ByteFrequency;

/// Every built-in analysis module.
pub fn catalog() -> Catalog {
    Catalog::new()
        .with(Module::extractor(ByteHistogram::info(), ByteHistogram))
        .with(Module::extractor(Entropy::info(), Entropy))
        .with(Module::analyzer(SizeSummary::info(), SizeSummary))
        .with(Module::map_reducer(ByteFrequency::info(), ByteFrequency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use kiln_core::{Config, Context, Dispatcher, Oid, Options, Value};
    use kiln_registry::{DispatchResult, Extractor, Host};
    use kiln_store::{ArtifactKey, LockMode, LockObserver};

    /// Counts calls into the wrapped extractor.
    struct Counted<E> {
        inner: E,
        calls: Arc<AtomicUsize>,
    }

    impl<E: Extractor> Extractor for Counted<E> {
        fn process(&self, host: &dyn Host, oid: &Oid, opts: &Options) -> DispatchResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.process(host, oid, opts)
        }
    }

    /// Largest number of simultaneous writers seen on any key.
    #[derive(Default)]
    struct WriterTracer {
        writers: Mutex<HashMap<ArtifactKey, usize>>,
        peak: AtomicUsize,
    }

    impl LockObserver for WriterTracer {
        fn acquired(&self, key: &ArtifactKey, mode: LockMode) {
            if mode == LockMode::Write {
                let mut writers = self.writers.lock().unwrap();
                let n = writers.entry(key.clone()).or_default();
                *n += 1;
                self.peak.fetch_max(*n, Ordering::SeqCst);
            }
        }

        fn released(&self, key: &ArtifactKey, mode: LockMode) {
            if mode == LockMode::Write {
                if let Some(n) = self.writers.lock().unwrap().get_mut(key) {
                    *n -= 1;
                }
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        dispatcher: Dispatcher,
        histogram_calls: Arc<AtomicUsize>,
        tracer: Arc<WriterTracer>,
    }

    fn fixture(workers: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path());
        config.multiprocessing.workers = workers;
        config.general.lock_timeout_secs = 30;

        let histogram_calls = Arc::new(AtomicUsize::new(0));
        let mut catalog = catalog();
        catalog.add(Module::extractor(
            ByteHistogram::info(),
            Counted {
                inner: ByteHistogram,
                calls: histogram_calls.clone(),
            },
        ));
        let tracer = Arc::new(WriterTracer::default());
        let observer: Arc<dyn LockObserver> = tracer.clone();
        let ctx = Context::builder(config)
            .catalog(catalog)
            .observer(observer)
            .build()
            .unwrap();
        Fixture {
            _dir: dir,
            dispatcher: Dispatcher::new(ctx).unwrap(),
            histogram_calls,
            tracer,
        }
    }

    fn import_corpus(d: &Dispatcher, n: usize) -> Vec<Oid> {
        (0..n)
            .map(|i| {
                let bytes: Vec<u8> = (0..(64 + i)).map(|j| ((i * 7 + j * 13) % 251) as u8).collect();
                d.import_bytes(&format!("sample{i}.bin"), &bytes).unwrap()
            })
            .collect()
    }

    #[test]
    fn catalog_has_every_kind() {
        let catalog = catalog();
        let names: Vec<&str> = catalog.names().collect();
        assert_eq!(names, vec!["byte_frequency", "byte_histogram", "entropy", "size_summary"]);
        assert!(catalog.get("entropy").unwrap().info.opts.get("block_size").unwrap().mangle);
    }

    #[test]
    fn concurrent_clients_write_each_histogram_once() {
        let f = fixture(4);
        let d = &f.dispatcher;
        let oids = import_corpus(d, 100);
        let cid = d.create_collection("corpus", &oids, "hundred files").unwrap();

        let processor = {
            let d = d.clone();
            thread::spawn(move || d.process("byte_histogram", &[cid], &Options::new(), false))
        };
        let reader = {
            let d = d.clone();
            thread::spawn(move || d.retrieve("byte_histogram", &[cid], &Options::new(), true))
        };
        assert!(processor.join().unwrap().unwrap());
        let values = reader.join().unwrap().unwrap().unwrap();

        assert_eq!(values.as_map().unwrap().len(), 100);
        assert_eq!(f.histogram_calls.load(Ordering::SeqCst), 100);
        assert_eq!(f.tracer.peak.load(Ordering::SeqCst), 1);

        // Flush one artifact: only it is recomputed.
        let victim = oids[42];
        assert!(d.flush_artifact("byte_histogram", &victim, &Options::new()).unwrap());
        let again = d.retrieve("byte_histogram", &[cid], &Options::new(), false).unwrap().unwrap();
        assert_eq!(again, values);
        assert_eq!(f.histogram_calls.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn entropy_depends_on_histogram() {
        let f = fixture(1);
        let d = &f.dispatcher;
        let oid = d.import_bytes("ab", b"abababab").unwrap();

        let whole = d.retrieve("entropy", &[oid], &Options::new(), false).unwrap().unwrap();
        assert!((whole.get("entropy").unwrap().as_f64().unwrap() - 1.0).abs() < 1e-9);
        assert!(whole.get("blocks").is_none());
        assert!(d.exists("byte_histogram", &oid, &Options::new()).unwrap());

        let mut opts = Options::new();
        opts.insert("block_size".into(), Value::Int(4));
        opts.insert("trace".into(), Value::Bool(true));
        let blocked = d.retrieve("entropy", &[oid], &opts, false).unwrap().unwrap();
        assert_eq!(blocked.get("blocks").unwrap().as_list().unwrap().len(), 2);
        assert_eq!(d.context().store().list_keys("entropy").unwrap().len(), 2);
        assert_eq!(f.histogram_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn size_summary_over_a_collection() {
        let f = fixture(2);
        let d = &f.dispatcher;
        let small = d.import_bytes("s", b"12").unwrap();
        let big = d.import_bytes("b", b"123456").unwrap();
        let cid = d.create_collection("two", &[small, big], "").unwrap();

        let mut opts = Options::new();
        opts.insert("largest".into(), Value::Int(1));
        let summary = d.retrieve("size_summary", &[cid], &opts, false).unwrap().unwrap();
        assert_eq!(summary.get("count"), Some(&Value::Int(2)));
        assert_eq!(summary.get("total"), Some(&Value::Int(8)));
        assert_eq!(summary.get("min"), Some(&Value::Int(2)));
        assert_eq!(summary.get("max"), Some(&Value::Int(6)));
        assert_eq!(
            summary.get("largest"),
            Some(&Value::List(vec![Value::Str(big.to_hex())]))
        );
        assert!(!d.exists("size_summary", &cid, &opts).unwrap());
    }

    #[test]
    fn byte_frequency_reduces_histograms() {
        let f = fixture(3);
        let d = &f.dispatcher;
        let a = d.import_bytes("a", b"aab").unwrap();
        let b = d.import_bytes("b", b"bbc").unwrap();
        let cid = d.create_collection("ab", &[a, b], "").unwrap();

        let mut opts = Options::new();
        opts.insert("top".into(), Value::Int(2));
        let freq = d.retrieve("byte_frequency", &[cid], &opts, false).unwrap().unwrap();
        assert_eq!(freq.get("files"), Some(&Value::Int(2)));
        assert_eq!(freq.get("total"), Some(&Value::Int(6)));
        let top = freq.get("top").unwrap().as_list().unwrap();
        assert_eq!(top[0], Value::List(vec![Value::Int(i64::from(b'b')), Value::Int(3)]));
        assert_eq!(top[1], Value::List(vec![Value::Int(i64::from(b'a')), Value::Int(2)]));
        assert!(d.exists("byte_frequency", &cid, &opts).unwrap());
        assert_eq!(f.histogram_calls.load(Ordering::SeqCst), 2);
    }
}
