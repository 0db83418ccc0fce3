//! Rosters: ordered lists of server identities.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::identity::ServerIdentity;
use crate::overlay::tree::Tree;

/// Deterministic 32-byte roster identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RosterId(pub [u8; 32]);

impl fmt::Display for RosterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for RosterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RosterId({})", hex::encode(self.0))
    }
}

/// An ordered set of server identities forming one cothority instance.
///
/// The id is derived from the member sequence, so every host that holds the
/// same ordered list computes the same id without coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    id: RosterId,
    #[serde(with = "crate::core::serialization::seq")]
    list: Vec<ServerIdentity>,
}

impl Roster {
    pub fn new(list: Vec<ServerIdentity>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"cothority.roster");
        hasher.update((list.len() as u32).to_be_bytes());
        for member in &list {
            hasher.update(member.public.0);
        }
        Self {
            id: RosterId(hasher.finalize().into()),
            list,
        }
    }

    pub fn id(&self) -> RosterId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ServerIdentity> {
        self.list.get(index)
    }

    pub fn members(&self) -> &[ServerIdentity] {
        &self.list
    }

    /// Position of `identity` in the roster, by public key.
    pub fn index_of(&self, identity: &ServerIdentity) -> Option<usize> {
        self.list.iter().position(|m| m.public == identity.public)
    }

    /// Derive the binary tree over this roster: member 0 is the root,
    /// member i's children are 2i+1 and 2i+2.
    pub fn generate_binary_tree(&self) -> Tree {
        Tree::new_binary(self.clone())
    }
}

impl PartialEq for Roster {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Roster {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, Keypair};

    fn roster_of(n: usize) -> Roster {
        let members = (0..n)
            .map(|i| Keypair::generate(Address::local(format!("r{i}"))).identity().clone())
            .collect();
        Roster::new(members)
    }

    #[test]
    fn id_depends_on_order() {
        let r = roster_of(3);
        let mut reversed = r.members().to_vec();
        reversed.reverse();
        let r2 = Roster::new(reversed);
        assert_ne!(r.id(), r2.id());
    }

    #[test]
    fn same_members_same_id() {
        let r = roster_of(4);
        let r2 = Roster::new(r.members().to_vec());
        assert_eq!(r.id(), r2.id());
    }

    #[test]
    fn index_of_finds_members() {
        let r = roster_of(3);
        for (i, m) in r.members().iter().enumerate() {
            assert_eq!(r.index_of(m), Some(i));
        }
    }
}
