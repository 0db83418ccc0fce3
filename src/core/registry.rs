//! Process-wide message-type registry.
//!
//! Every wire message registers under a canonical structural name; its
//! [`MessageTypeID`] is derived from that name by hashing, so independent
//! processes registering the same shape agree on the identifier without
//! coordination. Decoding looks the constructor up by id and yields a
//! type-erased [`Body`] that processors downcast.

use bincode::Options;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Domain prefix hashed into every message-type id.
const TYPE_ID_DOMAIN: &str = "cothority.msg/";

/// A decoded message body, downcast by whoever registered the type.
pub type Body = Box<dyn Any + Send + Sync>;

/// Stable 16-byte identifier of a message shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct MessageTypeID(pub [u8; 16]);

impl fmt::Display for MessageTypeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for MessageTypeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageTypeID({})", hex::encode(self.0))
    }
}

/// A message that can travel over a connection.
///
/// `NAME` is the canonical structural name the type registers under; two
/// processes that use the same name obtain the same [`MessageTypeID`].
pub trait Message: Serialize + DeserializeOwned + Any + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Derive the type id for `T` without touching the registry.
pub fn message_type_id<T: Message>() -> MessageTypeID {
    type_id_for_name(T::NAME)
}

fn type_id_for_name(name: &str) -> MessageTypeID {
    let mut hasher = Sha256::new();
    hasher.update(TYPE_ID_DOMAIN.as_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    MessageTypeID(id)
}

struct Entry {
    name: &'static str,
    decode: fn(&[u8]) -> Result<Body>,
}

static REGISTRY: Lazy<RwLock<HashMap<MessageTypeID, Entry>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn decode_erased<T: Message>(bytes: &[u8]) -> Result<Body> {
    let value: T = decode_as(bytes)?;
    Ok(Box::new(value))
}

/// Register `T` process-wide and return its id.
///
/// Registration is idempotent: registering the same shape twice is a no-op.
/// Two different constructors claiming one id is a programming error and
/// aborts the process, upholding the one-constructor-per-id invariant.
pub fn register_message<T: Message>() -> MessageTypeID {
    let id = message_type_id::<T>();
    let mut registry = REGISTRY.write().expect("message registry poisoned");
    if let Some(existing) = registry.get(&id) {
        assert_eq!(
            existing.name,
            T::NAME,
            "message-type id collision between {} and {}",
            existing.name,
            T::NAME
        );
        return id;
    }
    registry.insert(
        id,
        Entry {
            name: T::NAME,
            decode: decode_erased::<T>,
        },
    );
    id
}

/// Look up the registered name of a type id, if any.
pub fn registered_name(id: MessageTypeID) -> Option<&'static str> {
    REGISTRY
        .read()
        .expect("message registry poisoned")
        .get(&id)
        .map(|e| e.name)
}

/// Deterministic scalar encoding: big-endian, fixed-width integers.
///
/// Collection length prefixes never come from bincode (whose own headers
/// are 8-byte counts); every variable-length field of a wire message routes
/// through [`crate::core::serialization`], which writes the mandated `u32`
/// prefix itself.
fn wire_options() -> impl Options {
    bincode::options()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encode a message payload (without type id or frame header).
pub fn encode<T: Message>(value: &T) -> Result<Vec<u8>> {
    wire_options()
        .serialize(value)
        .map_err(|e| Error::Encoding(format!("{}: {e}", T::NAME)))
}

/// Decode a payload directly as `T`, bypassing the registry lookup.
pub fn decode_as<T: Message>(bytes: &[u8]) -> Result<T> {
    wire_options()
        .deserialize(bytes)
        .map_err(|e| Error::Encoding(format!("{}: {e}", T::NAME)))
}

/// Decode a payload through the registry.
///
/// # Errors
/// [`Error::UnknownType`] if no constructor is registered for `id`.
pub fn decode(id: MessageTypeID, bytes: &[u8]) -> Result<Body> {
    let decode = {
        let registry = REGISTRY.read().expect("message registry poisoned");
        let entry = registry.get(&id).ok_or_else(|| Error::UnknownType(id.to_string()))?;
        entry.decode
    };
    decode(bytes)
}

/// Encode a message as `type-id ‖ payload`, the self-describing form used
/// for client-request bodies and protocol-envelope interiors.
pub fn marshal<T: Message>(value: &T) -> Result<Vec<u8>> {
    let id = message_type_id::<T>();
    let payload = encode(value)?;
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&id.0);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Inverse of [`marshal`]: split off the type id and decode through the
/// registry.
pub fn unmarshal(bytes: &[u8]) -> Result<(MessageTypeID, Body)> {
    if bytes.len() < 16 {
        return Err(Error::Encoding("marshalled message shorter than a type id".into()));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[..16]);
    let id = MessageTypeID(id);
    let body = decode(id, &bytes[16..])?;
    Ok((id, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        i: u64,
        #[serde(with = "crate::core::serialization::string")]
        tag: String,
    }

    impl Message for Probe {
        const NAME: &'static str = "test.Probe";
    }

    #[test]
    fn id_is_stable_and_name_derived() {
        let a = message_type_id::<Probe>();
        let b = type_id_for_name("test.Probe");
        assert_eq!(a, b);
        assert_ne!(a, type_id_for_name("test.Probe2"));
    }

    #[test]
    fn registration_is_idempotent() {
        let a = register_message::<Probe>();
        let b = register_message::<Probe>();
        assert_eq!(a, b);
        assert_eq!(registered_name(a), Some("test.Probe"));
    }

    #[test]
    fn encode_decode_roundtrip() {
        register_message::<Probe>();
        let v = Probe { i: 12, tag: "x".into() };
        let bytes = encode(&v).unwrap();
        let body = decode(message_type_id::<Probe>(), &bytes).unwrap();
        assert_eq!(body.downcast_ref::<Probe>(), Some(&v));
    }

    #[test]
    fn encoding_is_deterministic() {
        let v = Probe { i: 99, tag: "det".into() };
        assert_eq!(encode(&v).unwrap(), encode(&v.clone()).unwrap());
    }

    #[test]
    fn unknown_type_is_reported() {
        let bogus = type_id_for_name("test.NeverRegistered");
        match decode(bogus, &[]) {
            Err(Error::UnknownType(_)) => {}
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn marshal_unmarshal() {
        register_message::<Probe>();
        let v = Probe { i: 7, tag: "m".into() };
        let bytes = marshal(&v).unwrap();
        let (id, body) = unmarshal(&bytes).unwrap();
        assert_eq!(id, message_type_id::<Probe>());
        assert_eq!(body.downcast_ref::<Probe>(), Some(&v));
    }
}
