use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::TypeError;

/// Content-derived identifier for any object known to kiln.
///
/// An `Oid` is the SHA-1 of an object's canonical bytes: the file contents
/// for file sources, or the sorted, deduplicated concatenation of member
/// OIDs for a collection. Identical content always produces the same `Oid`.
///
/// The textual form is 40 lowercase hex characters and is what appears in
/// file names, logs, and serialized output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid([u8; 20]);

impl Oid {
    /// Length of the hex representation.
    pub const HEX_LEN: usize = 40;

    /// Compute an `Oid` from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&digest);
        Self(arr)
    }

    /// Derive the identity of a set of OIDs.
    ///
    /// Members are sorted and deduplicated, their hex forms concatenated with
    /// no separator, and the result hashed. Input order and duplicates do not
    /// affect the outcome.
    pub fn from_members<'a, I>(members: I) -> Self
    where
        I: IntoIterator<Item = &'a Oid>,
    {
        let mut sorted: Vec<&Oid> = members.into_iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut hasher = Sha1::new();
        for oid in sorted {
            hasher.update(oid.to_hex().as_bytes());
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&hasher.finalize());
        Self(arr)
    }

    /// Create an `Oid` from a pre-computed digest.
    pub fn from_digest(digest: [u8; 20]) -> Self {
        Self(digest)
    }

    /// The raw 20-byte digest.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string. Uppercase input is accepted and normalized.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != Self::HEX_LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::HEX_LEN,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns `true` if `s` looks like an OID (40 hex characters).
    pub fn is_oid_like(s: &str) -> bool {
        s.len() == Self::HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.short_hex())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Oid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 20]> for Oid {
    fn from(digest: [u8; 20]) -> Self {
        Self(digest)
    }
}

impl Serialize for Oid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Oid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
