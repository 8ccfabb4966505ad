use kiln_options::Options;
use kiln_registry::{DispatchResult, Extractor, Host, ModuleInfo, ModuleKind};
use kiln_types::{Oid, Value};

pub const NAME: &str = "byte_histogram";

/// Count of every byte value in a file.
///
/// Stores `{counts: [256 ints], total, distinct}`.
pub struct ByteHistogram;

impl ByteHistogram {
    pub fn info() -> ModuleInfo {
        ModuleInfo::new(NAME, ModuleKind::Extractor)
            .describe("Occurrences of each byte value 0..=255 in a file")
    }
}

/// Histogram of `bytes` as 256 counters.
pub fn histogram(bytes: &[u8]) -> [u64; 256] {
    let mut counts = [0u64; 256];
    for b in bytes {
        counts[usize::from(*b)] += 1;
    }
    counts
}

/// Read the counters back out of a stored histogram.
pub fn counts_of(value: &Value) -> Option<[u64; 256]> {
    let list = value.get("counts")?.as_list()?;
    if list.len() != 256 {
        return None;
    }
    let mut counts = [0u64; 256];
    for (slot, item) in counts.iter_mut().zip(list) {
        *slot = u64::try_from(item.as_i64()?).ok()?;
    }
    Some(counts)
}

pub(crate) fn counts_value(counts: &[u64; 256]) -> Value {
    Value::List(counts.iter().map(|c| Value::from(*c)).collect())
}

impl Extractor for ByteHistogram {
    fn process(&self, host: &dyn Host, oid: &Oid, opts: &Options) -> DispatchResult<bool> {
        let Some(bytes) = host.file_bytes(oid)? else {
            return Ok(false);
        };
        let counts = histogram(&bytes);
        let mut out = Value::map();
        out.insert("counts", counts_value(&counts));
        out.insert("total", bytes.len());
        out.insert("distinct", counts.iter().filter(|c| **c > 0).count());
        host.store(NAME, oid, opts, out)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_byte() {
        let counts = histogram(b"abca");
        assert_eq!(counts[usize::from(b'a')], 2);
        assert_eq!(counts[usize::from(b'c')], 1);
        assert_eq!(counts.iter().sum::<u64>(), 4);
    }

    #[test]
    fn counts_survive_a_value_round_trip() {
        let counts = histogram(&[0, 0, 255]);
        let mut v = Value::map();
        v.insert("counts", counts_value(&counts));
        assert_eq!(counts_of(&v), Some(counts));
        assert_eq!(counts_of(&Value::map()), None);
    }
}
