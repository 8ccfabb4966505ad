//! `module.toml` manifests.
//!
//! A manifest enables a compiled-in module and may adjust its metadata. The
//! option table is data: it can change defaults, mangle flags and
//! descriptions, or declare new options, without touching module code.
//!
//! ```toml
//! name = "entropy"
//! description = "Shannon entropy of file contents"
//!
//! [options.block_size]
//! default = 1024
//! mangle = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_options::{OptSpec, OptType, OptionSchema};
use kiln_types::Value;
use serde::Deserialize;

use crate::error::{RegistryError, RegistryResult};
use crate::module::ModuleInfo;

/// File name looked up in every module directory.
pub const MANIFEST_FILE: &str = "module.toml";

#[derive(Clone, Debug, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub description: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, ManifestOption>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ManifestOption {
    #[serde(rename = "type")]
    pub ty: Option<OptType>,
    pub default: Option<toml::Value>,
    pub mangle: Option<bool>,
    pub description: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Manifest {
    pub fn load(path: &Path) -> RegistryResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|reason| RegistryError::Manifest {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Apply the manifest on top of a module's compiled metadata.
    pub fn apply(&self, info: &mut ModuleInfo, path: &Path) -> RegistryResult<()> {
        if let Some(description) = &self.description {
            info.description = description.clone();
        }
        let mut schema = info.opts.clone();
        for (name, opt) in &self.options {
            schema = apply_option(schema, name, opt).map_err(|reason| RegistryError::Manifest {
                path: path.to_path_buf(),
                reason,
            })?;
        }
        info.opts = schema;
        Ok(())
    }
}

fn apply_option(schema: OptionSchema, name: &str, opt: &ManifestOption) -> Result<OptionSchema, String> {
    let mut spec = match (schema.get(name), opt.ty) {
        (Some(existing), None) => existing.clone(),
        (Some(existing), Some(ty)) if existing.ty == ty => existing.clone(),
        (Some(existing), Some(ty)) => {
            return Err(format!("option {name} is declared {}, manifest says {ty}", existing.ty))
        }
        (None, Some(ty)) => OptSpec::new(ty, Value::Null),
        (None, None) => return Err(format!("new option {name} needs a type")),
    };
    if let Some(default) = &opt.default {
        let raw = toml_to_value(default);
        spec.default = spec
            .ty
            .coerce(&raw)
            .ok_or_else(|| format!("default for {name} is not a valid {}", spec.ty))?;
    }
    if let Some(mangle) = opt.mangle {
        spec.mangle = mangle;
    }
    if let Some(description) = &opt.description {
        spec.description = description.clone();
    }
    Ok(schema.option(name, spec))
}

/// Convert a TOML value into the artifact value model.
pub fn toml_to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::Str(s.clone()),
        toml::Value::Integer(i) => Value::Int(*i),
        toml::Value::Float(f) => Value::Float(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(d) => Value::Str(d.to_string()),
        toml::Value::Array(items) => Value::List(items.iter().map(toml_to_value).collect()),
        toml::Value::Table(table) => Value::Map(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_value(v)))
                .collect(),
        ),
    }
}

/// Every `<dir>/<name>/module.toml` directly below `dir`, sorted by path.
pub fn find_manifests(dir: &Path) -> RegistryResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path().join(MANIFEST_FILE);
        if entry.file_type()?.is_dir() && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}
