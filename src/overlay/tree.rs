//! Trees derived from rosters.
//!
//! Nodes live in an arena indexed by tree position; parent and child links
//! are indices, which keeps the structure serializable and free of reference
//! cycles. All identifiers are hashes of the structure, so every
//! participating host derives the same ids independently.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::identity::ServerIdentity;
use crate::overlay::roster::Roster;

/// Deterministic 32-byte tree identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeId(pub [u8; 32]);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeId({})", hex::encode(self.0))
    }
}

/// Deterministic 32-byte tree-node identifier: `SHA-256(tree-id ‖ index)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeNodeId(pub [u8; 32]);

impl fmt::Display for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeNodeId({})", hex::encode(self.0))
    }
}

/// One position in a [`Tree`]: a roster member plus its parent/child links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: TreeNodeId,
    /// Position of this node in the tree's arena.
    pub tree_index: usize,
    /// Position of the occupying identity in the roster.
    pub roster_index: usize,
    /// Arena index of the parent; `None` for the root.
    pub parent: Option<usize>,
    /// Arena indices of the children, in order.
    #[serde(with = "crate::core::serialization::seq")]
    pub children: Vec<usize>,
}

impl TreeNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A rooted tree over a roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    id: TreeId,
    roster: Roster,
    #[serde(with = "crate::core::serialization::seq")]
    nodes: Vec<TreeNode>,
}

impl Tree {
    /// Binary tree in roster order: root = member 0, children of i are
    /// 2i+1 and 2i+2.
    pub fn new_binary(roster: Roster) -> Self {
        let n = roster.len();
        let id = {
            let mut hasher = Sha256::new();
            hasher.update(b"cothority.tree");
            hasher.update(roster.id().0);
            hasher.update((n as u32).to_be_bytes());
            for i in 0..n {
                hasher.update((i as u32).to_be_bytes());
            }
            TreeId(hasher.finalize().into())
        };
        let nodes = (0..n)
            .map(|i| {
                let left = 2 * i + 1;
                let right = 2 * i + 2;
                let mut children = Vec::new();
                if left < n {
                    children.push(left);
                }
                if right < n {
                    children.push(right);
                }
                TreeNode {
                    id: node_id(id, i),
                    tree_index: i,
                    roster_index: i,
                    parent: if i == 0 { None } else { Some((i - 1) / 2) },
                    children,
                }
            })
            .collect();
        Self { id, roster, nodes }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> Option<&TreeNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The identity occupying `node`.
    pub fn identity(&self, node: &TreeNode) -> &ServerIdentity {
        &self.roster.members()[node.roster_index]
    }

    /// The tree node occupied by `identity`, if any.
    pub fn node_of(&self, identity: &ServerIdentity) -> Option<&TreeNode> {
        let roster_index = self.roster.index_of(identity)?;
        self.nodes.iter().find(|n| n.roster_index == roster_index)
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tree {}

fn node_id(tree: TreeId, index: usize) -> TreeNodeId {
    let mut hasher = Sha256::new();
    hasher.update(tree.0);
    hasher.update((index as u32).to_be_bytes());
    TreeNodeId(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, Keypair};

    fn roster_of(n: usize) -> Roster {
        let members = (0..n)
            .map(|i| Keypair::generate(Address::local(format!("t{i}"))).identity().clone())
            .collect();
        Roster::new(members)
    }

    #[test]
    fn binary_shape_of_four() {
        let tree = roster_of(4).generate_binary_tree();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.root().children, vec![1, 2]);
        assert_eq!(tree.node(1).unwrap().children, vec![3]);
        assert!(tree.node(2).unwrap().is_leaf());
        assert!(tree.node(3).unwrap().is_leaf());
        assert_eq!(tree.node(3).unwrap().parent, Some(1));
    }

    #[test]
    fn ids_are_deterministic() {
        let roster = roster_of(5);
        let a = roster.generate_binary_tree();
        let b = Roster::new(roster.members().to_vec()).generate_binary_tree();
        assert_eq!(a.id(), b.id());
        for (na, nb) in a.nodes().iter().zip(b.nodes()) {
            assert_eq!(na.id, nb.id);
        }
    }

    #[test]
    fn node_ids_differ_per_index() {
        let tree = roster_of(3).generate_binary_tree();
        assert_ne!(tree.node(0).unwrap().id, tree.node(1).unwrap().id);
        assert_ne!(tree.node(1).unwrap().id, tree.node(2).unwrap().id);
    }

    #[test]
    fn singleton_tree() {
        let tree = roster_of(1).generate_binary_tree();
        assert!(tree.root().is_root());
        assert!(tree.root().is_leaf());
    }
}
