use std::collections::BTreeMap;
use std::fmt;

use kiln_types::Value;
use serde::{Deserialize, Serialize};

use crate::error::{OptionError, OptionResult};
use crate::fingerprint;

/// Option values keyed by option name.
pub type Options = BTreeMap<String, Value>;

/// Declared type of an option.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptType {
    Bool,
    Int,
    Float,
    Str,
    List,
    /// Accepts any value unchanged.
    Any,
}

impl fmt::Display for OptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::List => "list",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

impl OptType {
    /// Coerce `value` to this type.
    ///
    /// Strings are parsed into scalars so values typed at a command line
    /// validate the same as programmatic ones.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::Any, v) => Some(v.clone()),

            (Self::Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
            (Self::Bool, Value::Int(0)) => Some(Value::Bool(false)),
            (Self::Bool, Value::Int(1)) => Some(Value::Bool(true)),
            (Self::Bool, Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Some(Value::Bool(false)),
                _ => None,
            },

            (Self::Int, Value::Int(i)) => Some(Value::Int(*i)),
            (Self::Int, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                Some(Value::Int(*f as i64))
            }
            (Self::Int, Value::Str(s)) => s.trim().parse::<i64>().ok().map(Value::Int),

            (Self::Float, Value::Float(f)) => Some(Value::Float(*f)),
            (Self::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
            (Self::Float, Value::Str(s)) => s.trim().parse::<f64>().ok().map(Value::Float),

            (Self::Str, Value::Str(s)) => Some(Value::Str(s.clone())),
            (Self::Str, Value::Int(i)) => Some(Value::Str(i.to_string())),
            (Self::Str, Value::Float(f)) => Some(Value::Str(f.to_string())),
            (Self::Str, Value::Bool(b)) => Some(Value::Str(b.to_string())),

            (Self::List, Value::List(items)) => Some(Value::List(items.clone())),
            (Self::List, Value::Set(items)) => Some(Value::List(items.iter().cloned().collect())),
            (Self::List, Value::Str(s)) if s.is_empty() => Some(Value::List(Vec::new())),
            (Self::List, Value::Str(s)) => Some(Value::List(
                s.split(',').map(|part| Value::from(part.trim())).collect(),
            )),
            (Self::List, Value::Null) => Some(Value::List(Vec::new())),
            (Self::List, v) => Some(Value::List(vec![v.clone()])),

            _ => None,
        }
    }
}

/// Declaration of one option.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptSpec {
    #[serde(rename = "type")]
    pub ty: OptType,
    pub default: Value,
    /// Whether the option participates in the storage key.
    #[serde(default)]
    pub mangle: bool,
    #[serde(default)]
    pub description: String,
}

impl OptSpec {
    pub fn new(ty: OptType, default: impl Into<Value>) -> Self {
        Self {
            ty,
            default: default.into(),
            mangle: false,
            description: String::new(),
        }
    }

    /// Mark this option as part of the storage key.
    pub fn mangle(mut self) -> Self {
        self.mangle = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The full option declaration of a module.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSchema {
    specs: BTreeMap<String, OptSpec>,
}

impl OptionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style declaration.
    pub fn option(mut self, name: impl Into<String>, spec: OptSpec) -> Self {
        self.specs.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&OptSpec> {
        self.specs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptSpec)> {
        self.specs.iter()
    }

    /// Every option at its default.
    pub fn defaults(&self) -> Options {
        self.specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default.clone()))
            .collect()
    }

    /// Full validation, run before computing.
    ///
    /// Every supplied option must be declared and coerce to its type;
    /// missing options take their default.
    pub fn validate(&self, supplied: &Options) -> OptionResult<Options> {
        let mut out = self.defaults();
        for (name, value) in supplied {
            let spec = self
                .specs
                .get(name)
                .ok_or_else(|| OptionError::Undeclared(name.clone()))?;
            out.insert(name.clone(), coerce(name, spec, value)?);
        }
        Ok(out)
    }

    /// Mangle-only validation, run before a cache lookup.
    ///
    /// Only mangle options are checked and returned; undeclared and
    /// non-mangle options are ignored.
    pub fn validate_mangle(&self, supplied: &Options) -> OptionResult<Options> {
        let mut out = Options::new();
        for (name, spec) in self.specs.iter().filter(|(_, s)| s.mangle) {
            let value = match supplied.get(name) {
                Some(value) => coerce(name, spec, value)?,
                None => spec.default.clone(),
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    /// The non-default mangle subset of already-validated options.
    pub fn mangle_subset<'a>(&'a self, validated: &'a Options) -> Vec<(&'a str, &'a Value)> {
        validated
            .iter()
            .filter_map(|(name, value)| {
                let spec = self.specs.get(name)?;
                (spec.mangle && *value != spec.default).then_some((name.as_str(), value))
            })
            .collect()
    }

    /// Fingerprint of already-validated options.
    pub fn fingerprint(&self, validated: &Options) -> OptionResult<String> {
        fingerprint::fingerprint(&self.mangle_subset(validated))
    }

    /// Human-readable rendering used by module documentation.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, spec) in &self.specs {
            let mangle = if spec.mangle { " [mangle]" } else { "" };
            out.push_str(&format!(
                "  {name} ({}, default {}){mangle}",
                spec.ty,
                spec.default.to_json()
            ));
            if !spec.description.is_empty() {
                out.push_str(&format!(": {}", spec.description));
            }
            out.push('\n');
        }
        out
    }
}

fn coerce(name: &str, spec: &OptSpec, value: &Value) -> OptionResult<Value> {
    spec.ty.coerce(value).ok_or_else(|| OptionError::Coercion {
        option: name.to_string(),
        expected: spec.ty.to_string(),
        found: value.type_name().to_string(),
    })
}
