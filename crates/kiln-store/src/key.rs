//! Artifact keys and their on-disk names.
//!
//! An artifact is addressed by `(module, oid, fingerprint)`. Inside the
//! module's directory the artifact file is named `<oid>` when the fingerprint
//! is empty, otherwise `<oid>.<fingerprint>`. Lockfiles for the same key are
//! named `<oid>_<fingerprint>_<module>.lock.<disc>`.

use std::fmt;

use kiln_types::Oid;

use crate::error::{StoreError, StoreResult};

/// Address of a single stored artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub module: String,
    pub oid: Oid,
    /// Option fingerprint; empty when all mangle options are defaulted.
    pub fingerprint: String,
}

impl ArtifactKey {
    pub fn new(module: impl Into<String>, oid: Oid, fingerprint: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            oid,
            fingerprint: fingerprint.into(),
        }
    }

    /// Key with an empty fingerprint.
    pub fn plain(module: impl Into<String>, oid: Oid) -> Self {
        Self::new(module, oid, String::new())
    }

    /// File name of the artifact inside the module directory.
    pub fn file_name(&self) -> String {
        if self.fingerprint.is_empty() {
            self.oid.to_hex()
        } else {
            format!("{}.{}", self.oid, self.fingerprint)
        }
    }

    /// Common prefix of every lockfile for this key.
    pub fn lock_stem(&self) -> String {
        format!("{}_{}_{}.lock", self.oid, self.fingerprint, self.module)
    }

    /// Parse an artifact file name back into `(oid, fingerprint)`.
    ///
    /// Returns `None` for lockfiles, temporary files, and anything else that
    /// is not an artifact.
    pub fn parse_file_name(name: &str) -> Option<(Oid, String)> {
        let (oid_part, fingerprint) = match name.split_once('.') {
            Some((oid, fp)) => (oid, fp),
            None => (name, ""),
        };
        if !Oid::is_oid_like(oid_part) {
            return None;
        }
        if !fingerprint.is_empty() && !is_fingerprint_like(fingerprint) {
            return None;
        }
        let oid = Oid::from_hex(oid_part).ok()?;
        Some((oid, fingerprint.to_string()))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.file_name())
    }
}

fn is_fingerprint_like(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Validate a module name for use as a directory name.
///
/// Names are non-empty and consist of ASCII alphanumerics, `_` and `-`.
pub fn validate_module_name(name: &str) -> StoreResult<()> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidModuleName(name.to_string()))
    }
}
