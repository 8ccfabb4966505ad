use kiln_options::{OptSpec, OptType, OptionSchema, Options};
use kiln_registry::{Analyzer, DispatchResult, Host, ModuleInfo, ModuleKind};
use kiln_types::{Oid, Value};

pub const NAME: &str = "size_summary";

/// Size statistics over a set of files, read from `file_meta`.
///
/// Returns `{count, total, min, max, mean, largest}` where `largest` lists
/// up to `largest` OIDs by descending size. OIDs without metadata are
/// counted under `missing`.
pub struct SizeSummary;

impl SizeSummary {
    pub fn info() -> ModuleInfo {
        ModuleInfo::new(NAME, ModuleKind::Analyzer)
            .describe("Count, total, min, max and mean file size")
            .with_opts(OptionSchema::new().option(
                "largest",
                OptSpec::new(OptType::Int, 5i64).describe("how many of the largest files to list"),
            ))
    }
}

impl Analyzer for SizeSummary {
    fn results(&self, host: &dyn Host, oids: &[Oid], opts: &Options) -> DispatchResult<Value> {
        let keep = opts
            .get("largest")
            .and_then(Value::as_i64)
            .unwrap_or(5)
            .max(0) as usize;

        let mut sizes: Vec<(i64, Oid)> = Vec::with_capacity(oids.len());
        let mut missing = 0usize;
        for oid in oids {
            let size = host
                .load("file_meta", oid, &Options::new())?
                .and_then(|meta| meta.get("size").and_then(Value::as_i64));
            match size {
                Some(size) => sizes.push((size, *oid)),
                None => missing += 1,
            }
        }

        let mut out = Value::map();
        let total: i64 = sizes.iter().map(|(s, _)| s).sum();
        out.insert("count", sizes.len());
        out.insert("missing", missing);
        out.insert("total", total);
        if !sizes.is_empty() {
            out.insert("min", sizes.iter().map(|(s, _)| *s).min().unwrap_or(0));
            out.insert("max", sizes.iter().map(|(s, _)| *s).max().unwrap_or(0));
            out.insert("mean", total as f64 / sizes.len() as f64);
        }

        sizes.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let largest: Vec<Value> = sizes
            .iter()
            .take(keep)
            .map(|(_, oid)| Value::Str(oid.to_hex()))
            .collect();
        out.insert("largest", Value::List(largest));
        Ok(out)
    }
}
