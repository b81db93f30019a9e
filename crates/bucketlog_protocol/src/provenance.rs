//! Replication provenance bitsets.

use crate::error::{ProtocolError, ProtocolResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A growable bitset recording which replication sources a stored file
/// already reflects.
///
/// Bit `i` lives in byte `i / 8` under mask `1 << (i % 8)`. Trailing zero
/// bytes are trimmed, so two sets with the same members compare equal and
/// encode identically. On the wire the bytes are URL-safe base64.
///
/// # Invariants
///
/// - `x.inside(&y)` iff every bit set in `x` is set in `y`
/// - `x.inside(&x.union(&y))` and `y.inside(&x.union(&y))`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Provenance {
    bytes: Vec<u8>,
}

impl Provenance {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding a single bit.
    #[must_use]
    pub fn with_bit(bit: usize) -> Self {
        let mut set = Self::new();
        set.insert(bit);
        set
    }

    /// Sets a bit.
    pub fn insert(&mut self, bit: usize) {
        let byte = bit / 8;
        if self.bytes.len() <= byte {
            self.bytes.resize(byte + 1, 0);
        }
        self.bytes[byte] |= 1 << (bit % 8);
    }

    /// Returns true if a bit is set.
    pub fn contains(&self, bit: usize) -> bool {
        self.bytes
            .get(bit / 8)
            .map_or(false, |b| b & (1 << (bit % 8)) != 0)
    }

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the bitwise OR of two sets.
    #[must_use]
    pub fn union(&self, other: &Provenance) -> Provenance {
        let len = self.bytes.len().max(other.bytes.len());
        let bytes = (0..len)
            .map(|i| {
                self.bytes.get(i).copied().unwrap_or(0) | other.bytes.get(i).copied().unwrap_or(0)
            })
            .collect();
        Self::from_raw(bytes)
    }

    /// Returns true if every bit of `self` is also set in `other`.
    pub fn inside(&self, other: &Provenance) -> bool {
        self.bytes
            .iter()
            .enumerate()
            .all(|(i, b)| b & !other.bytes.get(i).copied().unwrap_or(0) == 0)
    }

    /// Encodes the set as URL-safe base64.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.bytes)
    }

    /// Decodes a set from URL-safe base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64.
    pub fn decode(s: &str) -> ProtocolResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| ProtocolError::InvalidEncoding(format!("provenance {s:?}: {e}")))?;
        Ok(Self::from_raw(bytes))
    }

    fn from_raw(mut bytes: Vec<u8>) -> Self {
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        Self { bytes }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for Provenance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Provenance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Provenance::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn provenance() -> impl Strategy<Value = Provenance> {
        prop::collection::vec(0usize..40, 0..6).prop_map(|bits| {
            let mut p = Provenance::new();
            for bit in bits {
                p.insert(bit);
            }
            p
        })
    }

    #[test]
    fn bits_and_membership() {
        let mut p = Provenance::new();
        assert!(p.is_empty());
        p.insert(0);
        p.insert(9);
        assert!(p.contains(0));
        assert!(p.contains(9));
        assert!(!p.contains(1));
        assert!(!p.contains(100));
    }

    #[test]
    fn encoding_roundtrip_and_trimming() {
        let p = Provenance::with_bit(3).union(&Provenance::with_bit(17));
        assert_eq!(Provenance::decode(&p.encode()).unwrap(), p);

        // trailing zero bytes do not change identity
        let padded = Provenance::decode(&URL_SAFE_NO_PAD.encode([0b1000u8, 0, 0])).unwrap();
        assert_eq!(padded, Provenance::with_bit(3));
        assert!(Provenance::decode("***").is_err());
    }

    #[test]
    fn serde_as_base64_string() {
        let p = Provenance::with_bit(1);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, format!("\"{}\"", p.encode()));
        let back: Provenance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn superset_is_not_inside_subset() {
        let a = Provenance::with_bit(0);
        let b = Provenance::with_bit(12);
        assert!(!a.union(&b).inside(&a));
        assert!(Provenance::new().inside(&a));
    }

    proptest! {
        #[test]
        fn inside_is_reflexive(x in provenance()) {
            prop_assert!(x.inside(&x));
        }

        #[test]
        fn operands_are_inside_union(a in provenance(), b in provenance()) {
            let u = a.union(&b);
            prop_assert!(a.inside(&u));
            prop_assert!(b.inside(&u));
        }

        #[test]
        fn union_not_inside_when_other_adds_bits(a in provenance(), b in provenance()) {
            prop_assume!(!b.inside(&a));
            prop_assert!(!a.union(&b).inside(&a));
        }
    }
}
