use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Environment variable that overrides `dirs.root`.
pub const HOME_ENV: &str = "KILN_HOME";

/// Name of the configuration file inside the root directory.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Runtime configuration.
///
/// Built once, then shared read-only through the dispatcher context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dirs: DirsConfig,
    pub logging: LoggingConfig,
    pub general: GeneralConfig,
    pub multiprocessing: MultiprocessingConfig,
}

/// Directory layout. Relative paths resolve against `root`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirsConfig {
    pub root: PathBuf,
    pub db: PathBuf,
    pub scratch: PathBuf,
    pub modules: PathBuf,
    pub dev_modules: PathBuf,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".kiln"),
            db: PathBuf::from("db"),
            scratch: PathBuf::from("scratch"),
            modules: PathBuf::from("modules"),
            dev_modules: PathBuf::from("dev_modules"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `kiln_core=debug`.
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub verbosity: u8,
    /// Largest importable file in bytes. A file of exactly this size is
    /// accepted.
    pub max_file_size: u64,
    pub lock_timeout_secs: u64,
    /// Also scan `dirs.dev_modules` during discovery.
    pub dev_mode: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbosity: 1,
            max_file_size: 64 * 1024 * 1024,
            lock_timeout_secs: 60,
            dev_mode: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiprocessingConfig {
    pub enabled: bool,
    /// Worker count; 0 means one per available CPU.
    pub workers: usize,
}

impl Default for MultiprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 0,
        }
    }
}

impl Config {
    /// A default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.dirs.root = root.into();
        config
    }

    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file, falling back to defaults when it does not
    /// exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no configuration file; using defaults");
            Ok(Self::default())
        }
    }

    /// Resolve the configuration for this process: the file named by
    /// `path`, or `<root>/kiln.toml` where root comes from `KILN_HOME` or the
    /// default. `KILN_HOME` always wins over the file's `dirs.root`.
    pub fn resolve(path: Option<&Path>) -> ConfigResult<Self> {
        let env_root = std::env::var_os(HOME_ENV).map(PathBuf::from);
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => env_root
                .clone()
                .unwrap_or_else(|| DirsConfig::default().root)
                .join(CONFIG_FILE),
        };
        let mut config = Self::load_or_default(&path)?;
        if let Some(root) = env_root {
            config.dirs.root = root;
        }
        Ok(config)
    }

    /// Atomically overwrite `path` with this configuration.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::io(&dir, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| ConfigError::io(&dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| ConfigError::io(tmp.path().to_path_buf(), e))?;
        tmp.persist(path).map_err(|e| ConfigError::io(path, e.error))?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.general.lock_timeout_secs == 0 {
            return Err(ConfigError::Invalid("general.lock_timeout_secs must be positive".into()));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.level must not be empty".into()));
        }
        Ok(())
    }

    fn under_root(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dirs.root.join(p)
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.under_root(&self.dirs.db)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.under_root(&self.dirs.scratch)
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.under_root(&self.dirs.modules)
    }

    pub fn dev_modules_dir(&self) -> PathBuf {
        self.under_root(&self.dirs.dev_modules)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dirs.root.join(CONFIG_FILE)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.logging.file.as_deref().map(|p| self.under_root(p))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.general.lock_timeout_secs)
    }

    /// Effective worker count; 1 when multiprocessing is disabled.
    pub fn worker_count(&self) -> usize {
        if !self.multiprocessing.enabled {
            return 1;
        }
        match self.multiprocessing.workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }

    /// Read a setting by dotted key, e.g. `general.max_file_size`.
    pub fn get(&self, key: &str) -> ConfigResult<String> {
        let table = toml::Value::try_from(self)?;
        let mut cur = &table;
        for part in key.split('.') {
            cur = cur
                .get(part)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown setting: {key}")))?;
        }
        Ok(match cur {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Return a copy with one setting changed by dotted key.
    ///
    /// The value is parsed as TOML when possible and taken as a string
    /// otherwise, so `true`, `8` and `debug` all work unquoted.
    pub fn with_setting(&self, key: &str, raw: &str) -> ConfigResult<Self> {
        let mut table = toml::Value::try_from(self)?;
        let value = parse_setting(raw);

        let mut parts: Vec<&str> = key.split('.').collect();
        let last = parts
            .pop()
            .ok_or_else(|| ConfigError::Invalid("empty setting key".into()))?;
        let mut cur = &mut table;
        for part in parts {
            cur = cur
                .get_mut(part)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown setting: {key}")))?;
        }
        // Unset optional settings are absent from the table.
        cur.as_table_mut()
            .ok_or_else(|| ConfigError::Invalid(format!("unknown setting: {key}")))?
            .insert(last.to_string(), value);

        let updated: Self = table
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(format!("{key}: {e}")))?;
        updated.get(key)?;
        updated.validate()?;
        Ok(updated)
    }
}

fn parse_setting(raw: &str) -> toml::Value {
    let doc = format!("v = {raw}");
    match toml::from_str::<toml::Table>(&doc) {
        Ok(mut t) => t.remove("v").unwrap_or_else(|| toml::Value::String(raw.to_string())),
        Err(_) => toml::Value::String(raw.to_string()),
    }
}
