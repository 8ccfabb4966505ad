//! File import.
//!
//! Importing stores the bytes under the `files` source (once per distinct
//! content) and merges the file's name, path and stat into its `file_meta`
//! record. Names accumulate as a set across imports of identical content.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_options::Options;
use kiln_registry::{DispatchError, DispatchResult};
use kiln_store::{ArtifactKey, LockMode};
use kiln_types::{Oid, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::dispatcher::Dispatcher;
use crate::sources::{FILES, FILE_META};

/// Outcome of [`Dispatcher::import_path`].
#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: Vec<(PathBuf, Oid)>,
    pub skipped: Vec<(PathBuf, DispatchError)>,
}

impl ImportReport {
    /// Distinct OIDs imported, in first-seen order.
    pub fn oids(&self) -> Vec<Oid> {
        let mut seen = BTreeSet::new();
        self.imported
            .iter()
            .filter(|(_, oid)| seen.insert(*oid))
            .map(|(_, oid)| *oid)
            .collect()
    }
}

/// Filesystem facts recorded with an import.
struct Origin<'a> {
    path: Option<&'a Path>,
    stat: Option<Value>,
}

impl Dispatcher {
    fn check_size(&self, what: &str, len: u64) -> DispatchResult<()> {
        let cap = self.context().config().general.max_file_size;
        if len > cap {
            return Err(DispatchError::BadInput(format!(
                "{what} is {len} bytes; the limit is {cap}"
            )));
        }
        Ok(())
    }

    /// Import one file from disk.
    pub fn import_file(&self, path: &Path) -> DispatchResult<Oid> {
        let io_err = |e: std::io::Error| DispatchError::StoreIo(format!("{}: {e}", path.display()));
        let metadata = std::fs::metadata(path).map_err(io_err)?;
        if !metadata.is_file() {
            return Err(DispatchError::BadInput(format!("{} is not a regular file", path.display())));
        }
        self.check_size(&path.display().to_string(), metadata.len())?;
        let bytes = std::fs::read(path).map_err(io_err)?;
        self.check_size(&path.display().to_string(), bytes.len() as u64)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let stat = stat_value(&metadata);
        let abs = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.record_import(
            &name,
            &bytes,
            Origin {
                path: Some(&abs),
                stat: Some(stat),
            },
        )
    }

    /// Import in-memory bytes under `name`.
    pub fn import_bytes(&self, name: &str, bytes: &[u8]) -> DispatchResult<Oid> {
        self.check_size(name, bytes.len() as u64)?;
        self.record_import(name, bytes, Origin { path: None, stat: None })
    }

    /// Import a file, or every regular file below a directory.
    ///
    /// Files that cannot be imported (too large, unreadable) are reported in
    /// `skipped`; the walk continues past them.
    pub fn import_path(&self, path: &Path) -> DispatchResult<ImportReport> {
        if path.is_file() {
            let oid = self.import_file(path)?;
            return Ok(ImportReport {
                imported: vec![(path.to_path_buf(), oid)],
                skipped: Vec::new(),
            });
        }
        if !path.is_dir() {
            return Err(DispatchError::BadInput(format!("{} does not exist", path.display())));
        }

        let mut report = ImportReport::default();
        let mut files = Vec::new();
        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            match entry {
                Ok(e) if e.file_type().is_file() => files.push(e.into_path()),
                Ok(_) => {}
                Err(e) => {
                    let at = e.path().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf());
                    report.skipped.push((at, DispatchError::StoreIo(e.to_string())));
                }
            }
        }

        let results = self.pool().map(&files, |file| self.import_file(file));
        for (file, result) in files.into_iter().zip(results) {
            match result {
                Ok(oid) => report.imported.push((file, oid)),
                Err(e @ (DispatchError::BadInput(_) | DispatchError::StoreIo(_))) => {
                    warn!(path = %file.display(), error = %e, "skipped");
                    report.skipped.push((file, e));
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            root = %path.display(),
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            "directory imported"
        );
        Ok(report)
    }

    fn record_import(&self, name: &str, bytes: &[u8], origin: Origin<'_>) -> DispatchResult<Oid> {
        let oid = Oid::from_bytes(bytes);
        let store = self.store_ref();
        let none = Options::new();

        let files_key = ArtifactKey::plain(FILES, oid);
        let guard = store.lock(&files_key, LockMode::Write)?;
        let fresh = !store.exists(&files_key)?;
        if fresh {
            self.store(FILES, &oid, &none, &Value::Bytes(bytes.to_vec()))?;
        }
        guard.release()?;

        let size = bytes.len();
        let now = Utc::now().to_rfc3339();
        let meta_key = ArtifactKey::plain(FILE_META, oid);
        store.update(&meta_key, &mut |current: Option<Value>| {
            let mut meta = match current {
                Some(v @ Value::Map(_)) => v,
                _ => {
                    let mut m = Value::map();
                    m.insert("first_imported", now.as_str());
                    m
                }
            };
            meta.insert("names", add_to_set(meta.get("names"), name));
            if let Some(path) = origin.path {
                let shown = path.display().to_string();
                meta.insert("paths", add_to_set(meta.get("paths"), &shown));
            }
            meta.insert("size", size);
            if let Some(stat) = &origin.stat {
                meta.insert("stat", stat.clone());
            }
            meta
        })?;

        if fresh {
            info!(%oid, name, size, "imported");
        } else {
            debug!(%oid, name, "already imported; name recorded");
        }
        Ok(oid)
    }
}

fn add_to_set(existing: Option<&Value>, item: &str) -> Value {
    let mut set = match existing {
        Some(Value::Set(items)) => items.clone(),
        _ => BTreeSet::new(),
    };
    set.insert(Value::from(item));
    Value::Set(set)
}

fn stat_value(metadata: &std::fs::Metadata) -> Value {
    let mut stat = Value::map();
    stat.insert("len", metadata.len());
    stat.insert("readonly", metadata.permissions().readonly());
    if let Ok(modified) = metadata.modified() {
        stat.insert("modified", DateTime::<Utc>::from(modified).to_rfc3339());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        stat.insert("mode", u64::from(metadata.permissions().mode()));
    }
    stat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dispatcher, dispatcher_with};
    use proptest::prelude::*;

    #[test]
    fn hello_has_known_oid_and_size() {
        let (_dir, d) = dispatcher(1);
        let oid = d.import_bytes("hello.txt", b"hello").unwrap();
        assert_eq!(oid.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert!(d.exists(FILES, &oid, &Options::new()).unwrap());
        assert_eq!(
            d.get_field(FILE_META, &oid, "size", &Options::new()).unwrap(),
            Some(Value::Int(5))
        );
        assert_eq!(d.source_of(&oid).unwrap().as_deref(), Some(FILES));
    }

    #[test]
    fn identical_content_collapses_names() {
        let (dir, d) = dispatcher(1);
        for sub in ["a", "b"] {
            let p = dir.path().join("in").join(sub);
            std::fs::create_dir_all(&p).unwrap();
            std::fs::write(p.join("x"), b"same bytes").unwrap();
        }
        let o1 = d.import_file(&dir.path().join("in/a/x")).unwrap();
        let o2 = d.import_file(&dir.path().join("in/b/x")).unwrap();
        assert_eq!(o1, o2);

        let names = d.get_field(FILE_META, &o1, "names", &Options::new()).unwrap().unwrap();
        assert_eq!(names, Value::Set([Value::from("x")].into_iter().collect()));
        let paths = d.get_field(FILE_META, &o1, "paths", &Options::new()).unwrap().unwrap();
        assert_eq!(paths.as_set().unwrap().len(), 2);
    }

    #[test]
    fn retrieving_files_returns_the_bytes() {
        let (_dir, d) = dispatcher(1);
        let oid = d.import_bytes("b", &[0, 1, 2, 255]).unwrap();
        let value = d.retrieve(FILES, &[oid], &Options::new(), false).unwrap();
        assert_eq!(value, Some(Value::Bytes(vec![0, 1, 2, 255])));
    }

    #[test]
    fn size_cap_is_inclusive() {
        let (dir, d) = dispatcher_with(1, |c| c.general.max_file_size = 8);
        assert!(d.import_bytes("empty", b"").is_ok());
        assert!(d.import_bytes("exact", &[7u8; 8]).is_ok());
        assert!(matches!(
            d.import_bytes("over", &[7u8; 9]),
            Err(DispatchError::BadInput(_))
        ));

        let big = dir.path().join("big.bin");
        std::fs::write(&big, [1u8; 9]).unwrap();
        assert!(matches!(d.import_file(&big), Err(DispatchError::BadInput(_))));
        assert!(d.store_ref().list_oids(FILES).unwrap().len() == 2);
    }

    #[test]
    fn directory_import_skips_oversized_files() {
        let (dir, d) = dispatcher_with(2, |c| c.general.max_file_size = 4);
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("a"), b"aa").unwrap();
        std::fs::write(tree.join("sub").join("b"), b"bb").unwrap();
        std::fs::write(tree.join("sub").join("c"), b"aa").unwrap();
        std::fs::write(tree.join("large"), b"too large").unwrap();

        let report = d.import_path(&tree).unwrap();
        assert_eq!(report.imported.len(), 3);
        assert_eq!(report.oids().len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].0.ends_with("large"));
    }

    #[test]
    fn missing_path_is_bad_input() {
        let (dir, d) = dispatcher(1);
        assert!(matches!(
            d.import_path(&dir.path().join("nope")),
            Err(DispatchError::BadInput(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn oid_is_sha1_of_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let (_dir, d) = dispatcher(1);
            let oid = d.import_bytes("p", &bytes).unwrap();
            prop_assert_eq!(oid, Oid::from_bytes(&bytes));
            let stored = d.retrieve(FILES, &[oid], &Options::new(), false).unwrap();
            prop_assert_eq!(stored, Some(Value::Bytes(bytes)));
        }
    }
}
