//! Server identities and addresses.
//!
//! A [`ServerIdentity`] is the stable identifier of one process: an ed25519
//! public key plus the address it can be reached at. Identity equality is
//! by public key only; the address is routing information.
//!
//! Address format: `scheme://payload`
//!
//! Supported schemes:
//! - `tcp://host:port` - production transport
//! - `local://name` - in-process transport (testing)

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Transport scheme of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// TCP transport; the payload is `host:port`.
    Tcp,
    /// In-process transport; the payload is an arbitrary name.
    Local,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Local => "local",
        }
    }
}

/// A reachable address in the form `scheme://payload`.
///
/// On the wire an address travels as its `u32`-length-prefixed display
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    scheme: Scheme,
    payload: String,
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        crate::core::serialization::string::serialize(&self.to_string(), serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = crate::core::serialization::string::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Address {
    /// Create a TCP address from a `host:port` pair.
    pub fn tcp(host_port: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Tcp,
            payload: host_port.into(),
        }
    }

    /// Create an in-process address.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Local,
            payload: name.into(),
        }
    }

    /// The transport scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The part after `scheme://`; for TCP this is what a socket binds or
    /// connects to.
    pub fn network_address(&self) -> &str {
        &self.payload
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.payload)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, payload) = s
            .split_once("://")
            .ok_or_else(|| Error::ConfigInvalid(format!("address missing '://': {s}")))?;
        if payload.is_empty() {
            return Err(Error::ConfigInvalid(format!("address has empty payload: {s}")));
        }
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "local" => Scheme::Local,
            other => {
                return Err(Error::ConfigInvalid(format!("unknown address scheme: {other}")))
            }
        };
        Ok(Self {
            scheme,
            payload: payload.to_string(),
        })
    }
}

/// Raw 32-byte ed25519 public key.
///
/// Stored as bytes rather than a checked curve point so that identities can
/// be compared, hashed and ordered without a validity proof; the point is
/// only decoded when a signature is actually verified. The total order on
/// keys is what resolves duplicate concurrent dials between two routers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicId(pub [u8; 32]);

impl PublicId {
    /// All-zero placeholder for a connection whose peer has not completed
    /// the identity handshake yet.
    pub fn unknown() -> Self {
        Self([0u8; 32])
    }

    /// Decode into a verifying key. Fails for the placeholder and for bytes
    /// that are not a valid curve point.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| Error::Encoding(format!("invalid public key: {e}")))
    }

    /// Verify `signature` over `message` with this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicId({})", hex::encode(self.0))
    }
}

/// Stable identifier of one server process: public key plus address.
///
/// Equality and hashing go by public key only, so a server that moves to a
/// new address keeps its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub public: PublicId,
    pub address: Address,
}

impl ServerIdentity {
    pub fn new(public: PublicId, address: Address) -> Self {
        Self { public, address }
    }

    /// Identity of a peer known only by address, before the handshake has
    /// told us its key.
    pub fn unverified(address: Address) -> Self {
        Self {
            public: PublicId::unknown(),
            address,
        }
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for ServerIdentity {}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public.hash(state);
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.public, self.address)
    }
}

/// A server's signing key together with its public identity.
pub struct Keypair {
    signing: SigningKey,
    identity: ServerIdentity,
}

impl Keypair {
    /// Generate a fresh keypair reachable at `address`.
    pub fn generate(address: Address) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let identity = ServerIdentity::new(PublicId(signing.verifying_key().to_bytes()), address);
        Self { signing, identity }
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_bytes(secret: &[u8; 32], address: Address) -> Self {
        let signing = SigningKey::from_bytes(secret);
        let identity = ServerIdentity::new(PublicId(signing.verifying_key().to_bytes()), address);
        Self { signing, identity }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn public(&self) -> PublicId {
        self.identity.public
    }

    /// Sign `message` with the server's key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("identity", &self.identity).finish()
    }
}
