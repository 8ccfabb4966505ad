use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use kiln_options::OptionError;
use kiln_store::StoreError;
use kiln_types::TypeError;

/// Errors from module registration and discovery.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// I/O error while scanning a module directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `module.toml` could not be parsed.
    #[error("invalid manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// A manifest names a module that is not compiled in.
    #[error("manifest {path} names unknown module '{name}'")]
    NotInCatalog { name: String, path: PathBuf },

    /// A manifest sits under the directory of a different kind.
    #[error("module '{name}' is a {actual}, found under the {expected} directory")]
    KindMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Two modules share a name.
    #[error("module '{0}' is already registered")]
    Duplicate(String),

    /// The module name cannot be used as a storage directory.
    #[error("invalid module name: {0:?}")]
    InvalidName(String),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Failure kinds surfaced by dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// An option was undeclared or mistyped, or an OID was malformed.
    #[error("bad input: {0}")]
    BadInput(String),

    /// An OID list cannot be processed by this module.
    #[error("bad OID list for '{module}': {reason}")]
    BadOidList { module: String, reason: String },

    /// The module name is not registered.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// A lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    /// Reading or writing the artifact store failed.
    #[error("store error: {0}")]
    StoreIo(String),

    /// A module body reported failure.
    #[error("module '{module}' failed on {target}: {reason}")]
    ModuleFailure {
        module: String,
        target: String,
        reason: String,
    },

    /// The configuration or module directory is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Build a module failure.
    pub fn module_failure(
        module: impl Into<String>,
        target: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::ModuleFailure {
            module: module.into(),
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    pub fn bad_oid_list(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadOidList {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Whether a batch caller should keep going after this error.
    ///
    /// Bad input and unknown modules halt the whole operation; everything
    /// else is confined to the OID that produced it.
    pub fn is_per_oid(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::StoreIo(_) | Self::ModuleFailure { .. }
        )
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout { key, waited } => Self::LockTimeout { key, waited },
            StoreError::InvalidModuleName(name) => Self::UnknownModule(name),
            other => Self::StoreIo(other.to_string()),
        }
    }
}

impl From<OptionError> for DispatchError {
    fn from(err: OptionError) -> Self {
        Self::BadInput(err.to_string())
    }
}

impl From<TypeError> for DispatchError {
    fn from(err: TypeError) -> Self {
        Self::BadInput(err.to_string())
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result alias for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
