//! Merkle proof trees over request batches.
//!
//! Leaves and interior nodes are domain-separated by a one-byte tweak, so
//! a leaf value cannot be confused with an interior hash. An odd node at
//! the end of a level is promoted unchanged.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A SHA-256 output.
pub type HashId = [u8; 32];

/// Tweak prepended to leaf data before hashing.
const LEAF_TWEAK: &[u8] = &[0x00];

/// Tweak prepended to interior-node input before hashing.
const NODE_TWEAK: &[u8] = &[0x01];

/// Hash a leaf payload into the tree's leaf space.
pub fn hash_leaf(data: &[u8]) -> HashId {
    let mut hasher = Sha256::new();
    hasher.update(LEAF_TWEAK);
    hasher.update(data);
    hasher.finalize().into()
}

fn hash_node(left: &HashId, right: &HashId) -> HashId {
    let mut hasher = Sha256::new();
    hasher.update(NODE_TWEAK);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// One sibling on the path from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: HashId,
    /// Whether the sibling sits to the right of the running hash.
    pub right: bool,
}

/// Inclusion proof: the sibling path authenticating one leaf against a
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Proof(#[serde(with = "crate::core::serialization::seq")] pub Vec<ProofStep>);

impl Proof {
    /// Fold the proof over `leaf`, yielding the root it commits to.
    pub fn root_from(&self, leaf: HashId) -> HashId {
        let mut acc = leaf;
        for step in &self.0 {
            acc = if step.right {
                hash_node(&acc, &step.hash)
            } else {
                hash_node(&step.hash, &acc)
            };
        }
        acc
    }

    /// Verify that this proof connects `data`'s leaf hash to `root`.
    pub fn verify(&self, data: &[u8], root: &HashId) -> bool {
        self.root_from(hash_leaf(data)) == *root
    }
}

/// Build the Merkle tree over `batch` and return the root together with one
/// inclusion proof per element, in batch order.
///
/// An empty batch yields the all-zero root and no proofs.
pub fn proof_tree(batch: &[Vec<u8>]) -> (HashId, Vec<Proof>) {
    if batch.is_empty() {
        return ([0u8; 32], Vec::new());
    }
    let mut level: Vec<HashId> = batch.iter().map(|data| hash_leaf(data)).collect();
    let mut proofs: Vec<Proof> = vec![Proof::default(); batch.len()];
    // Position of each original leaf within the current level.
    let mut positions: Vec<usize> = (0..batch.len()).collect();

    while level.len() > 1 {
        for (leaf, pos) in positions.iter_mut().enumerate() {
            let idx = *pos;
            let sibling = idx ^ 1;
            if sibling < level.len() {
                proofs[leaf].0.push(ProofStep {
                    hash: level[sibling],
                    right: sibling > idx,
                });
            }
            *pos = idx / 2;
        }
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => next.push(hash_node(left, right)),
                [odd] => next.push(*odd),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    (level[0], proofs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("statement-{i}").into_bytes()).collect()
    }

    #[test]
    fn every_proof_verifies() {
        for n in 1..=9 {
            let batch = batch_of(n);
            let (root, proofs) = proof_tree(&batch);
            assert_eq!(proofs.len(), n);
            for (i, proof) in proofs.iter().enumerate() {
                assert!(proof.verify(&batch[i], &root), "leaf {i} of {n}");
            }
        }
    }

    #[test]
    fn wrong_leaf_fails() {
        let batch = batch_of(5);
        let (root, proofs) = proof_tree(&batch);
        for proof in &proofs {
            assert!(!proof.verify(b"forged statement", &root));
        }
    }

    #[test]
    fn proof_does_not_transfer_between_leaves() {
        let batch = batch_of(4);
        let (root, proofs) = proof_tree(&batch);
        assert!(!proofs[0].verify(&batch[1], &root));
    }

    #[test]
    fn single_leaf_has_empty_proof() {
        let batch = batch_of(1);
        let (root, proofs) = proof_tree(&batch);
        assert!(proofs[0].0.is_empty());
        assert_eq!(root, hash_leaf(&batch[0]));
    }

    #[test]
    fn empty_batch_yields_zero_root() {
        let (root, proofs) = proof_tree(&[]);
        assert_eq!(root, [0u8; 32]);
        assert!(proofs.is_empty());
    }

    #[test]
    fn root_is_order_sensitive() {
        let batch = batch_of(3);
        let mut reversed = batch.clone();
        reversed.reverse();
        assert_ne!(proof_tree(&batch).0, proof_tree(&reversed).0);
    }
}
