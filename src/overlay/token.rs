//! Protocol-instance tokens.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::overlay::roster::RosterId;
use crate::overlay::tree::TreeId;
use crate::service::ServiceId;

/// Random per-instance identifier; the root draws it once and every
/// participant adopts it from the envelope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub [u8; 16]);

impl InstanceId {
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", hex::encode(self.0))
    }
}

/// Stable identifier of one protocol instance across every participating
/// host. Two hosts holding equal tokens are part of the same logical run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub roster_id: RosterId,
    pub tree_id: TreeId,
    /// The service that owns (and can spawn) this kind of instance.
    pub service: ServiceId,
    /// Name of the protocol being run.
    #[serde(with = "crate::core::serialization::string")]
    pub protocol: String,
    pub instance: InstanceId,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.protocol, self.instance, self.tree_id)
    }
}
