//! Storage-key fingerprints.
//!
//! A fingerprint is the lowercase hex of the bincode encoding of the sorted
//! `(name, value)` pairs of every mangle option whose value differs from its
//! default. Defaults produce the empty fingerprint, so adding a new mangle
//! option to a module never invalidates its existing artifacts.
//!
//! Encodings longer than [`MAX_DIRECT_LEN`] hex characters are replaced by
//! the SHA-1 digest of the encoding to keep file names bounded. Digest
//! fingerprints are exactly 40 characters; a direct encoding of even one
//! pair with a non-empty name is longer, so the two forms never collide.

use kiln_types::Value;
use sha1::{Digest, Sha1};

use crate::error::{OptionError, OptionResult};

/// Longest direct fingerprint, in hex characters.
pub const MAX_DIRECT_LEN: usize = 160;

/// Length of a digest fingerprint.
pub const DIGEST_LEN: usize = 40;

/// Compute the fingerprint of the non-default mangle pairs.
///
/// `pairs` need not be sorted.
pub fn fingerprint(pairs: &[(&str, &Value)]) -> OptionResult<String> {
    if pairs.is_empty() {
        return Ok(String::new());
    }
    let mut owned: Vec<(String, Value)> = pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), (*value).clone()))
        .collect();
    owned.sort();

    let encoded = bincode::serialize(&owned).map_err(|e| OptionError::Encoding(e.to_string()))?;
    let direct = hex::encode(&encoded);
    if direct.len() <= MAX_DIRECT_LEN {
        Ok(direct)
    } else {
        Ok(hex::encode(Sha1::digest(&encoded)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_pairs_give_empty_fingerprint() {
        assert_eq!(fingerprint(&[]).unwrap(), "");
    }

    #[test]
    fn order_does_not_matter() {
        let a = Value::Int(1);
        let b = Value::from("x");
        let fp1 = fingerprint(&[("a", &a), ("b", &b)]).unwrap();
        let fp2 = fingerprint(&[("b", &b), ("a", &a)]).unwrap();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn direct_fingerprint_is_lowercase_hex_of_the_encoding() {
        let v = Value::Int(512);
        let fp = fingerprint(&[("block", &v)]).unwrap();
        assert!(fp.len() > DIGEST_LEN);
        assert!(fp.bytes().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        let pairs: Vec<(String, Value)> = bincode::deserialize(&hex::decode(&fp).unwrap()).unwrap();
        assert_eq!(pairs, vec![("block".to_string(), v)]);
    }

    #[test]
    fn long_encodings_are_digested() {
        let v = Value::from("a".repeat(200));
        let fp = fingerprint(&[("label", &v)]).unwrap();
        assert_eq!(fp.len(), DIGEST_LEN);
    }

    #[test]
    fn shortest_direct_encoding_is_longer_than_a_digest() {
        let v = Value::Null;
        let fp = fingerprint(&[("n", &v)]).unwrap();
        assert!(fp.len() > DIGEST_LEN);
    }

    proptest! {
        #[test]
        fn distinct_values_give_distinct_fingerprints(a in any::<i64>(), b in any::<i64>()) {
            prop_assume!(a != b);
            let va = Value::Int(a);
            let vb = Value::Int(b);
            prop_assert_ne!(
                fingerprint(&[("n", &va)]).unwrap(),
                fingerprint(&[("n", &vb)]).unwrap()
            );
        }

        #[test]
        fn fingerprints_are_file_name_safe(s in "[ -~]{0,64}") {
            let v = Value::from(s.as_str());
            let fp = fingerprint(&[("label", &v)]).unwrap();
            prop_assert!(fp.bytes().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
