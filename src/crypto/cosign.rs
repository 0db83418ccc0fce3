//! Collective signatures.
//!
//! A collective signature is one signature share per roster member over the
//! same message, collected through the signing tree. Verification demands a
//! valid share from every member; a missing or invalid share rejects the
//! whole signature. The container is scheme-agnostic: an aggregated
//! cosignature can replace it without touching the protocol that collects
//! shares.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::overlay::Roster;

/// One member's contribution: its roster index plus an ed25519 signature
/// over the collective message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    pub index: u32,
    #[serde(with = "crate::core::serialization::bytes")]
    pub signature: Vec<u8>,
}

/// The assembled signature of a whole roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveSignature {
    #[serde(with = "crate::core::serialization::seq")]
    pub shares: Vec<SignatureShare>,
}

impl CollectiveSignature {
    /// Assemble from shares, ordering them by roster index.
    pub fn new(mut shares: Vec<SignatureShare>) -> Self {
        shares.sort_by_key(|s| s.index);
        Self { shares }
    }

    /// Check that every member of `roster` contributed a valid share over
    /// `message`, each exactly once.
    pub fn verify(&self, roster: &Roster, message: &[u8]) -> bool {
        if self.shares.len() != roster.len() {
            return false;
        }
        let mut seen = HashSet::with_capacity(self.shares.len());
        for share in &self.shares {
            let Some(member) = roster.get(share.index as usize) else {
                return false;
            };
            if !seen.insert(share.index) {
                return false;
            }
            if !member.public.verify(message, &share.signature) {
                return false;
            }
        }
        true
    }
}
