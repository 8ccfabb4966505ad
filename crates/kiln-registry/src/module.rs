use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use kiln_options::{OptionSchema, Options};
use kiln_types::{Oid, Value};
use serde::{Deserialize, Serialize};

use crate::error::DispatchResult;
use crate::host::Host;

// ---------------------------------------------------------------------------
// ModuleKind
// ---------------------------------------------------------------------------

/// How the dispatcher drives a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Computes and stores one artifact per OID.
    Extractor,
    /// Aggregates over an OID list; never cached.
    Analyzer,
    /// Maps each OID to a partial, then reduces the partials once per job.
    MapReducer,
    /// Owns primary bytes, membership, or per-OID metadata.
    Source,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 4] = [
        ModuleKind::Source,
        ModuleKind::Extractor,
        ModuleKind::Analyzer,
        ModuleKind::MapReducer,
    ];

    /// Directory under the module root that holds manifests of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Extractor => "extractors",
            Self::Analyzer => "analyzers",
            Self::MapReducer => "map_reducers",
            Self::Source => "sources",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Extractor => "extractor",
            Self::Analyzer => "analyzer",
            Self::MapReducer => "map_reducer",
            Self::Source => "source",
        };
        f.write_str(name)
    }
}

impl FromStr for ModuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "extractor" | "extractors" => Ok(Self::Extractor),
            "analyzer" | "analyzers" => Ok(Self::Analyzer),
            "map_reducer" | "map_reducers" => Ok(Self::MapReducer),
            "source" | "sources" => Ok(Self::Source),
            other => Err(format!("unknown module kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ModuleInfo
// ---------------------------------------------------------------------------

/// Static metadata the dispatcher consults for typing decisions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub kind: ModuleKind,
    /// Refuses set-valued OIDs.
    pub atomic: bool,
    /// Produces or consumes a set; collection OIDs are passed through.
    pub set: bool,
    pub opts: OptionSchema,
    pub description: String,
    /// Companion module holding per-OID metadata for this source.
    pub meta: Option<String>,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            atomic: false,
            set: false,
            opts: OptionSchema::new(),
            description: String::new(),
            meta: None,
        }
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn set_valued(mut self) -> Self {
        self.set = true;
        self
    }

    pub fn with_opts(mut self, opts: OptionSchema) -> Self {
        self.opts = opts;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    /// Whether this source owns OIDs (as opposed to annotating them).
    pub fn owns_oids(&self) -> bool {
        self.kind == ModuleKind::Source && self.meta.is_some()
    }

    /// Description followed by the rendered option schema.
    pub fn documentation(&self) -> String {
        let mut flags = Vec::new();
        if self.atomic {
            flags.push("atomic");
        }
        if self.set {
            flags.push("set");
        }
        let mut doc = format!("{} ({})", self.name, self.kind);
        if !flags.is_empty() {
            doc.push_str(&format!(" [{}]", flags.join(", ")));
        }
        doc.push('\n');
        if !self.description.is_empty() {
            doc.push_str(&self.description);
            doc.push('\n');
        }
        if let Some(meta) = &self.meta {
            doc.push_str(&format!("meta: {meta}\n"));
        }
        if self.opts.is_empty() {
            doc.push_str("options: none\n");
        } else {
            doc.push_str("options:\n");
            doc.push_str(&self.opts.render());
        }
        doc
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// A module that computes one artifact per OID.
///
/// The body stores its own result through [`Host::store`].
pub trait Extractor: Send + Sync {
    fn process(&self, host: &dyn Host, oid: &Oid, opts: &Options) -> DispatchResult<bool>;
}

/// A source module. OIDs handed to it may not exist yet.
pub trait Source: Send + Sync {
    fn process(&self, host: &dyn Host, oids: &[Oid], opts: &Options) -> DispatchResult<bool>;
}

/// A module that aggregates over a list of OIDs without caching.
pub trait Analyzer: Send + Sync {
    fn results(&self, host: &dyn Host, oids: &[Oid], opts: &Options) -> DispatchResult<Value>;
}

/// A module computed as a map over OIDs followed by one reduction.
///
/// Partials reach the reducer in arbitrary order, so the reduction must be
/// commutative and associative.
pub trait MapReducer: Send + Sync {
    fn mapper(&self, host: &dyn Host, oid: &Oid, opts: &Options, job: &Oid)
        -> DispatchResult<Value>;

    fn reducer(
        &self,
        host: &dyn Host,
        partials: Vec<Value>,
        opts: &Options,
        job: &Oid,
    ) -> DispatchResult<Value>;
}

/// The entry points of a registered module.
#[derive(Clone)]
pub enum ModuleBody {
    Extractor(Arc<dyn Extractor>),
    Analyzer(Arc<dyn Analyzer>),
    MapReducer(Arc<dyn MapReducer>),
    Source(Arc<dyn Source>),
}

impl ModuleBody {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Extractor(_) => ModuleKind::Extractor,
            Self::Analyzer(_) => ModuleKind::Analyzer,
            Self::MapReducer(_) => ModuleKind::MapReducer,
            Self::Source(_) => ModuleKind::Source,
        }
    }
}

impl fmt::Debug for ModuleBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleBody::{}", self.kind())
    }
}

/// Metadata paired with entry points.
#[derive(Clone, Debug)]
pub struct Module {
    pub info: ModuleInfo,
    pub body: ModuleBody,
}

impl Module {
    /// Pair metadata with a body. The info's kind follows the body.
    pub fn new(mut info: ModuleInfo, body: ModuleBody) -> Self {
        info.kind = body.kind();
        Self { info, body }
    }

    pub fn extractor(info: ModuleInfo, body: impl Extractor + 'static) -> Self {
        Self::new(info, ModuleBody::Extractor(Arc::new(body)))
    }

    pub fn analyzer(info: ModuleInfo, body: impl Analyzer + 'static) -> Self {
        Self::new(info, ModuleBody::Analyzer(Arc::new(body)))
    }

    pub fn map_reducer(info: ModuleInfo, body: impl MapReducer + 'static) -> Self {
        Self::new(info, ModuleBody::MapReducer(Arc::new(body)))
    }

    pub fn source(info: ModuleInfo, body: impl Source + 'static) -> Self {
        Self::new(info, ModuleBody::Source(Arc::new(body)))
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}
