use kiln_options::{OptSpec, OptType, OptionSchema, Options};
use kiln_registry::{DispatchError, DispatchResult, Host, MapReducer, ModuleInfo, ModuleKind};
use kiln_types::{Oid, Value};

use crate::extractors::byte_histogram::{self, counts_of, counts_value};

pub const NAME: &str = "byte_frequency";

/// Byte counts summed over every file of a job.
///
/// The mapper reads each file's `byte_histogram`; the reducer sums them and
/// ranks the `top` most frequent byte values.
pub struct ByteFrequency;

impl ByteFrequency {
    pub fn info() -> ModuleInfo {
        ModuleInfo::new(NAME, ModuleKind::MapReducer)
            .describe("Byte value frequencies across a set of files")
            .with_opts(OptionSchema::new().option(
                "top",
                OptSpec::new(OptType::Int, 8i64)
                    .mangle()
                    .describe("number of most frequent bytes to rank"),
            ))
    }
}

impl MapReducer for ByteFrequency {
    fn mapper(&self, host: &dyn Host, oid: &Oid, _opts: &Options, _job: &Oid) -> DispatchResult<Value> {
        let hist = host
            .retrieve_one(byte_histogram::NAME, oid, &Options::new())?
            .ok_or_else(|| DispatchError::module_failure(NAME, oid, "no byte_histogram"))?;
        counts_of(&hist)
            .map(|c| counts_value(&c))
            .ok_or_else(|| DispatchError::module_failure(NAME, oid, "malformed byte_histogram"))
    }

    fn reducer(
        &self,
        _host: &dyn Host,
        partials: Vec<Value>,
        opts: &Options,
        job: &Oid,
    ) -> DispatchResult<Value> {
        let mut totals = [0u64; 256];
        for partial in &partials {
            let Some(list) = partial.as_list() else {
                return Err(DispatchError::module_failure(NAME, job, "partial is not a list"));
            };
            for (slot, count) in totals.iter_mut().zip(list) {
                *slot += count.as_i64().unwrap_or(0).max(0) as u64;
            }
        }

        let top = opts.get("top").and_then(Value::as_i64).unwrap_or(8).max(0) as usize;
        let mut ranked: Vec<(usize, u64)> = totals
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(b, c)| (b, *c))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut out = Value::map();
        out.insert("files", partials.len());
        out.insert("total", totals.iter().sum::<u64>());
        out.insert("counts", counts_value(&totals));
        out.insert(
            "top",
            Value::List(
                ranked
                    .into_iter()
                    .take(top)
                    .map(|(b, c)| Value::List(vec![Value::from(b), Value::from(c)]))
                    .collect(),
            ),
        );
        Ok(out)
    }
}
