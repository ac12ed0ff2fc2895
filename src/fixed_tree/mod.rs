/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fixed-size Merkle trees.
//!
//! A [`FixedTree`] is a complete binary tree with a size known before it is built. Its nodes are stored
//! in a flat array in breadth-first order: the children of node `i` are `2i + 1` and `2i + 2`. Unlike a
//! classic Merkle tree, every node (not only the leaves) carries a payload: a `key` and an `extra`.
//!
//! ## Node hash
//!
//! ```text
//! hash(i) = SHA256(key_i ∥ extra_i ∥ hash(left_i) ∥ hash(right_i))
//! ```
//!
//! A missing child contributes no bytes. A node with an empty key and no children hashes to the empty
//! byte string.
//!
//! Trees are built through a [`FixedTreeGenerator`](generator::FixedTreeGenerator) and never change after
//! that. Inclusion proofs are produced by [`FixedTree::proof`] and checked by
//! [`prove_fixed_tree_proof`](proof::prove_fixed_tree_proof).

pub mod generator;

pub mod proof;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    crypto_primitives::{CryptoHasher, Digest},
    hint::{Hint, HintType},
};

pub use generator::FixedTreeGenerator;
pub use proof::{prove_fixed_tree_proof, FixedTreeProof};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeNode {
    index: u64,
    #[serde(with = "hex")]
    key: Vec<u8>,
    #[serde(with = "hex")]
    hash: Vec<u8>,
    #[serde(with = "hex")]
    extra: Vec<u8>,
}

impl FixedTreeNode {
    pub fn new(index: u64, key: Vec<u8>, hash: Vec<u8>, extra: Vec<u8>) -> Self {
        Self {
            index,
            key,
            hash,
            extra,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn extra(&self) -> &[u8] {
        &self.extra
    }

    pub(crate) fn set_hash(&mut self, hash: Vec<u8>) {
        self.hash = hash;
    }

    /// Whether `hash` matches the node's payload and the given children hashes.
    pub fn is_hash_valid(&self, left: Option<&[u8]>, right: Option<&[u8]>) -> bool {
        self.hash == node_hash(&self.key, &self.extra, left, right)
    }
}

/// Hash of a node from its payload and its children's hashes.
pub fn node_hash(key: &[u8], extra: &[u8], left: Option<&[u8]>, right: Option<&[u8]>) -> Vec<u8> {
    if key.is_empty() && left.is_none() && right.is_none() {
        return Vec::new();
    }

    let mut hasher = CryptoHasher::new();
    hasher.update(key);
    hasher.update(extra);
    if let Some(left) = left {
        hasher.update(left);
    }
    if let Some(right) = right {
        hasher.update(right);
    }
    hasher.finalize().to_vec()
}

/// Level of `index` in the tree; the root is at level 0.
pub fn level_of(index: u64) -> u32 {
    63 - (index + 1).leading_zeros()
}

/// Index of the first node of `level`.
fn first_index_of(level: u32) -> u64 {
    (1u64 << level) - 1
}

/// Parent index: with `L` the first index of `index`'s level and `p` its position in that level, the
/// parent is at position `p / 2` of the level above.
pub fn parent_index(index: u64) -> Result<u64, TreeError> {
    if index == 0 {
        return Err(TreeError::NoParent(index));
    }

    let level = level_of(index);
    let position = index - first_index_of(level);
    Ok(first_index_of(level - 1) + position / 2)
}

/// Indices of the children of `index` in a tree of `size` nodes.
pub fn children_indices(index: u64, size: u64) -> (Option<u64>, Option<u64>) {
    let level = level_of(index);
    let position = index - first_index_of(level);
    let left = first_index_of(level + 1) + position * 2;
    let right = left + 1;

    (
        Some(left).filter(|left| *left < size),
        Some(right).filter(|right| *right < size),
    )
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTree {
    #[serde(rename = "_hint")]
    hint: Hint,
    nodes: Vec<FixedTreeNode>,
}

impl FixedTree {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x60]), 0, 0, 1);

    /// Wrap already-hashed nodes. The result is not checked; call [`is_valid`](Self::is_valid) on trees
    /// from untrusted sources.
    pub fn new(nodes: Vec<FixedTreeNode>) -> Self {
        Self {
            hint: Self::HINT,
            nodes,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn hint(&self) -> &Hint {
        &self.hint
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[FixedTreeNode] {
        &self.nodes
    }

    pub fn node(&self, index: u64) -> Result<&FixedTreeNode, TreeError> {
        self.nodes.get(index as usize).ok_or(TreeError::OutOfRange {
            index,
            size: self.nodes.len() as u64,
        })
    }

    /// Hash of the root node, or `None` for an empty tree.
    pub fn root(&self) -> Option<&[u8]> {
        self.nodes.first().map(|root| root.hash())
    }

    /// Visit nodes in ascending index order until `f` returns `false`.
    pub fn traverse<F: FnMut(&FixedTreeNode) -> bool>(&self, mut f: F) {
        for node in &self.nodes {
            if !f(node) {
                break;
            }
        }
    }

    fn child_hashes(&self, index: u64) -> (Option<&[u8]>, Option<&[u8]>) {
        let (left, right) = children_indices(index, self.nodes.len() as u64);
        (
            left.map(|left| self.nodes[left as usize].hash()),
            right.map(|right| self.nodes[right as usize].hash()),
        )
    }

    /// Recompute every node hash and reject any mismatch.
    pub fn is_valid(&self) -> Result<(), TreeError> {
        for (position, node) in self.nodes.iter().enumerate() {
            if node.index() != position as u64 {
                return Err(TreeError::InvalidNode(format!(
                    "node at position {} has index {}",
                    position,
                    node.index()
                )));
            }
            if node.key().is_empty() {
                return Err(TreeError::EmptyKey(node.index()));
            }

            let (left, right) = self.child_hashes(node.index());
            if !node.is_hash_valid(left, right) {
                return Err(TreeError::HashNotMatch(node.index()));
            }
        }

        Ok(())
    }

    /// Inclusion proof for the node at `index`.
    pub fn proof(&self, index: u64) -> Result<FixedTreeProof, TreeError> {
        self.node(index)?;

        let mut path = vec![index];
        let mut current = index;
        while current != 0 {
            current = parent_index(current)?;
            path.push(current);
        }
        path.reverse();

        let steps = path
            .into_iter()
            .map(|index| {
                let (left, right) = self.child_hashes(index);
                proof::ProofStep::new(
                    self.nodes[index as usize].clone(),
                    left.map(<[u8]>::to_vec),
                    right.map(<[u8]>::to_vec),
                )
            })
            .collect();

        Ok(FixedTreeProof::new(steps))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("invalid node; {0}")]
    InvalidNode(String),
    #[error("node {0} has no parent")]
    NoParent(u64),
    #[error("empty node found in tree, {0}")]
    EmptyNodeInTree(u64),
    #[error("empty key, {0}")]
    EmptyKey(u64),
    #[error("hash not match, {0}")]
    HashNotMatch(u64),
    #[error("invalid proof; {0}")]
    InvalidProof(String),
    #[error("index {index} out of range; size={size}")]
    OutOfRange { index: u64, size: u64 },
}
