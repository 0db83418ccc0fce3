//! # Wire Field Serialization
//!
//! Field-level serializers enforcing the payload layout: integers are
//! big-endian fixed-width, variable-length fields carry a `u32` length
//! prefix, sequences carry a `u32` count then their elements.
//!
//! bincode alone cannot produce this layout: its own collection headers
//! are always a raw 8-byte count, whatever the integer encoding is set to.
//! Every `Vec`, `String` or byte-string field of a wire message therefore
//! goes through one of these helpers via `#[serde(with = "...")]`, which
//! emit the `u32` prefix themselves and hand the elements to the
//! underlying encoder one by one.
//!
//! The helpers encode a field as a headerless tuple `(count: u32,
//! element...)`. That shape only round-trips on non-self-describing
//! formats like bincode, which is the only format these messages travel
//! over.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Upper bound handed to `deserialize_tuple`; the real element count is the
/// `u32` read first, this only keeps the access gate open long enough.
const TUPLE_GATE: usize = usize::MAX;

fn count_of<S: Serializer>(len: usize) -> Result<u32, S::Error> {
    u32::try_from(len).map_err(|_| serde::ser::Error::custom("field longer than a u32 can count"))
}

/// `u32`-count-prefixed sequences: `count:u32 ‖ element ‖ ...`.
pub mod seq {
    use super::*;

    pub fn serialize<T, S>(v: &[T], serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        let count = count_of::<S>(v.len())?;
        let mut tuple = serializer.serialize_tuple(1 + v.len())?;
        tuple.serialize_element(&count)?;
        for element in v {
            tuple.serialize_element(element)?;
        }
        tuple.end()
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        struct SeqVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for SeqVisitor<T> {
            type Value = Vec<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a u32-counted sequence")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let count: u32 = access
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("sequence missing its count"))?;
                // Grown element by element; a hostile count runs into the
                // frame-size limit, not an allocation.
                let mut out = Vec::new();
                for _ in 0..count {
                    let element = access
                        .next_element()?
                        .ok_or_else(|| de::Error::custom("sequence shorter than its count"))?;
                    out.push(element);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_tuple(TUPLE_GATE, SeqVisitor(PhantomData))
    }
}

/// `u32`-length-prefixed byte strings: `len:u32 ‖ bytes`.
pub mod bytes {
    use super::*;

    pub fn serialize<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        seq::serialize(v, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        seq::deserialize(deserializer)
    }
}

/// `u32`-length-prefixed UTF-8 strings.
pub mod string {
    use super::*;

    pub fn serialize<S>(v: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        seq::serialize(v.as_bytes(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = seq::deserialize(deserializer)?;
        String::from_utf8(raw).map_err(|_| de::Error::custom("string field is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use crate::core::registry::{self, Message};
    use crate::core::serialization as wire;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Mixed {
        lead: u16,
        #[serde(with = "wire::bytes")]
        data: Vec<u8>,
        #[serde(with = "wire::string")]
        label: String,
        #[serde(with = "wire::seq")]
        values: Vec<u32>,
    }

    impl Message for Mixed {
        const NAME: &'static str = "test.wire.Mixed";
    }

    #[test]
    fn layout_uses_u32_prefixes() {
        let v = Mixed {
            lead: 0x0102,
            data: vec![0xaa, 0xbb, 0xcc],
            label: "hi".to_string(),
            values: vec![7],
        };
        let bytes = registry::encode(&v).unwrap();
        let expected: Vec<u8> = [
            &[0x01, 0x02][..],                   // lead, big-endian u16
            &[0, 0, 0, 3, 0xaa, 0xbb, 0xcc][..], // data: u32 len then bytes
            &[0, 0, 0, 2, b'h', b'i'][..],       // label: u32 len then UTF-8
            &[0, 0, 0, 1, 0, 0, 0, 7][..],       // values: u32 count then u32s
        ]
        .concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn roundtrip() {
        let v = Mixed {
            lead: 9,
            data: (0..200).collect(),
            label: "statement batch".to_string(),
            values: vec![1, 2, 3, u32::MAX],
        };
        let bytes = registry::encode(&v).unwrap();
        assert_eq!(registry::decode_as::<Mixed>(&bytes).unwrap(), v);
    }

    #[test]
    fn empty_fields_are_a_bare_count() {
        let v = Mixed {
            lead: 0,
            data: vec![],
            label: String::new(),
            values: vec![],
        };
        let bytes = registry::encode(&v).unwrap();
        assert_eq!(bytes, vec![0u8; 2 + 4 + 4 + 4]);
        assert_eq!(registry::decode_as::<Mixed>(&bytes).unwrap(), v);
    }

    #[test]
    fn short_sequence_is_rejected() {
        let v = Mixed {
            lead: 1,
            data: vec![1, 2, 3, 4],
            label: String::new(),
            values: vec![],
        };
        let mut bytes = registry::encode(&v).unwrap();
        bytes.truncate(bytes.len() - 9); // cut into the data bytes
        assert!(registry::decode_as::<Mixed>(&bytes).is_err());
    }

    #[test]
    fn non_utf8_string_is_rejected() {
        #[derive(Debug, Serialize, Deserialize)]
        struct JustBytes {
            #[serde(with = "wire::bytes")]
            data: Vec<u8>,
        }
        impl Message for JustBytes {
            const NAME: &'static str = "test.wire.JustBytes";
        }
        #[derive(Debug, Serialize, Deserialize)]
        struct JustString {
            #[serde(with = "wire::string")]
            label: String,
        }
        impl Message for JustString {
            const NAME: &'static str = "test.wire.JustString";
        }
        let bytes = registry::encode(&JustBytes { data: vec![0xff, 0xfe] }).unwrap();
        assert!(registry::decode_as::<JustString>(&bytes).is_err());
    }
}
