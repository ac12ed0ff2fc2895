/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inclusion proofs.
//!
//! A proof for node `i` lists, from the root down to `i`, every node on the path together with the
//! hashes of its two child slots. Verification recomputes each listed node's hash from its payload and
//! its child hashes, and checks that the next node on the path is the child it claims to be. Every key in
//! a proof is therefore covered by a recomputed hash, and every hash is either recomputed or linked.

use serde::{Deserialize, Serialize};

use super::{children_indices, parent_index, FixedTreeNode, TreeError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    node: FixedTreeNode,
    /// Hash of the left child; empty when there is none.
    #[serde(with = "hex")]
    left: Vec<u8>,
    #[serde(with = "hex")]
    right: Vec<u8>,
}

impl ProofStep {
    pub(crate) fn new(node: FixedTreeNode, left: Option<Vec<u8>>, right: Option<Vec<u8>>) -> Self {
        Self {
            node,
            left: left.unwrap_or_default(),
            right: right.unwrap_or_default(),
        }
    }

    pub fn node(&self) -> &FixedTreeNode {
        &self.node
    }

    pub fn left(&self) -> Option<&[u8]> {
        Some(self.left.as_slice()).filter(|left| !left.is_empty())
    }

    pub fn right(&self) -> Option<&[u8]> {
        Some(self.right.as_slice()).filter(|right| !right.is_empty())
    }

    pub fn node_mut(&mut self) -> &mut FixedTreeNode {
        &mut self.node
    }

    pub fn left_mut(&mut self) -> &mut Vec<u8> {
        &mut self.left
    }

    pub fn right_mut(&mut self) -> &mut Vec<u8> {
        &mut self.right
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeProof {
    steps: Vec<ProofStep>,
}

impl FixedTreeProof {
    pub(crate) fn new(steps: Vec<ProofStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[ProofStep] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [ProofStep] {
        &mut self.steps
    }

    /// Root hash the proof commits to.
    pub fn root(&self) -> Option<&[u8]> {
        self.steps.first().map(|step| step.node().hash())
    }

    /// The node whose inclusion is proven.
    pub fn target(&self) -> Option<&FixedTreeNode> {
        self.steps.last().map(ProofStep::node)
    }
}

/// Check a proof produced by [`FixedTree::proof`](super::FixedTree::proof).
pub fn prove_fixed_tree_proof(proof: &FixedTreeProof) -> Result<(), TreeError> {
    let steps = proof.steps();
    let first = steps
        .first()
        .ok_or_else(|| TreeError::InvalidProof("empty proof".to_string()))?;
    if first.node().index() != 0 {
        return Err(TreeError::InvalidProof("proof does not start at root".to_string()));
    }

    for (position, step) in steps.iter().enumerate() {
        let node = step.node();
        if node.key().is_empty() {
            return Err(TreeError::EmptyKey(node.index()));
        }
        if !node.is_hash_valid(step.left(), step.right()) {
            return Err(TreeError::HashNotMatch(node.index()));
        }

        let Some(next) = steps.get(position + 1) else {
            break;
        };
        let child = next.node();
        if parent_index(child.index())? != node.index() {
            return Err(TreeError::InvalidProof(format!(
                "node {} is not a child of {}",
                child.index(),
                node.index()
            )));
        }

        let (left, _) = children_indices(node.index(), u64::MAX);
        let linked = if Some(child.index()) == left {
            step.left()
        } else {
            step.right()
        };
        if linked != Some(child.hash()) {
            return Err(TreeError::HashNotMatch(child.index()));
        }
    }

    Ok(())
}
