use kiln_options::{OptSpec, OptType, OptionSchema, Options};
use kiln_registry::{DispatchError, DispatchResult, Extractor, Host, ModuleInfo, ModuleKind};
use kiln_types::{Oid, Value};
use tracing::debug;

use super::byte_histogram::{self, counts_of};

pub const NAME: &str = "entropy";

/// Shannon entropy of a file in bits per byte.
///
/// With `block_size` 0 the whole-file figure is derived from the stored
/// `byte_histogram`; otherwise the file is also split into blocks and each
/// block's entropy is listed.
pub struct Entropy;

impl Entropy {
    pub fn info() -> ModuleInfo {
        ModuleInfo::new(NAME, ModuleKind::Extractor)
            .describe("Shannon entropy in bits per byte, whole file and per block")
            .with_opts(
                OptionSchema::new()
                    .option(
                        "block_size",
                        OptSpec::new(OptType::Int, 0i64)
                            .mangle()
                            .describe("bytes per block; 0 for whole file only"),
                    )
                    .option(
                        "trace",
                        OptSpec::new(OptType::Bool, false).describe("log each block's entropy"),
                    ),
            )
    }
}

/// Entropy of a byte distribution given as counters.
pub fn entropy_of(counts: &[u64; 256]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

impl Extractor for Entropy {
    fn process(&self, host: &dyn Host, oid: &Oid, opts: &Options) -> DispatchResult<bool> {
        let block_size = opts.get("block_size").and_then(Value::as_i64).unwrap_or(0);
        if block_size < 0 {
            return Err(DispatchError::BadInput(format!(
                "block_size must not be negative, got {block_size}"
            )));
        }
        let trace = opts.get("trace").and_then(Value::as_bool).unwrap_or(false);

        let Some(hist) = host.retrieve_one(byte_histogram::NAME, oid, &Options::new())? else {
            return Ok(false);
        };
        let Some(counts) = counts_of(&hist) else {
            return Err(DispatchError::module_failure(NAME, oid, "malformed byte_histogram"));
        };

        let mut out = Value::map();
        out.insert("entropy", entropy_of(&counts));
        if block_size > 0 {
            let Some(bytes) = host.file_bytes(oid)? else {
                return Ok(false);
            };
            let blocks: Vec<Value> = bytes
                .chunks(block_size as usize)
                .enumerate()
                .map(|(i, block)| {
                    let e = entropy_of(&byte_histogram::histogram(block));
                    if trace {
                        debug!(%oid, block = i, entropy = e, "block entropy");
                    }
                    Value::Float(e)
                })
                .collect();
            out.insert("blocks", Value::List(blocks));
        }
        host.store(NAME, oid, opts, out)?;
        Ok(true)
    }
}
