/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Block`] type and its header, the [`Manifest`].
//!
//! A block's hash is its manifest's hash. The manifest commits to the proposal, the previous block, the
//! roots of the operations and states trees, and the confirmation time. It does not commit to
//! `created_at`, which is local bookkeeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fixed_tree::FixedTree;

use super::{
    basic::{time_bytes, Address, Height, Round, Stage},
    crypto_primitives::ValueHash,
    hint::{Hint, HintType},
    operation::Operation,
    proposal::Proposal,
    state::State,
    voteproof::Voteproof,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "_hint")]
    hint: Hint,
    hash: ValueHash,
    height: Height,
    round: Round,
    proposal: ValueHash,
    previous_block: ValueHash,
    operations_hash: Option<ValueHash>,
    states_hash: Option<ValueHash>,
    confirmed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl Manifest {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x10]), 0, 0, 1);

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        height: Height,
        round: Round,
        proposal: ValueHash,
        previous_block: ValueHash,
        operations_hash: Option<ValueHash>,
        states_hash: Option<ValueHash>,
        confirmed_at: DateTime<Utc>,
    ) -> Self {
        let mut manifest = Self {
            hint: Self::HINT,
            hash: ValueHash::from_sha256_bytes(Vec::new()),
            height,
            round,
            proposal,
            previous_block,
            operations_hash,
            states_hash,
            confirmed_at,
            created_at: Utc::now(),
        };
        manifest.hash = manifest.generate_hash();
        manifest
    }

    /// SHA-256 over height, round, proposal, previous block, the optional tree roots and the confirmation
    /// time. `created_at` is left out.
    pub fn generate_hash(&self) -> ValueHash {
        let mut parts: Vec<Vec<u8>> = vec![
            self.height.to_le_bytes().to_vec(),
            self.round.to_le_bytes().to_vec(),
            self.proposal.bytes().to_vec(),
            self.previous_block.bytes().to_vec(),
        ];
        if let Some(operations_hash) = &self.operations_hash {
            parts.push(operations_hash.bytes().to_vec());
        }
        if let Some(states_hash) = &self.states_hash {
            parts.push(states_hash.bytes().to_vec());
        }
        parts.push(time_bytes(&self.confirmed_at));

        ValueHash::sha256(&parts)
    }

    pub fn hint(&self) -> &Hint {
        &self.hint
    }

    pub fn hash(&self) -> &ValueHash {
        &self.hash
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn proposal(&self) -> &ValueHash {
        &self.proposal
    }

    pub fn previous_block(&self) -> &ValueHash {
        &self.previous_block
    }

    pub fn operations_hash(&self) -> Option<&ValueHash> {
        self.operations_hash.as_ref()
    }

    pub fn states_hash(&self) -> Option<&ValueHash> {
        self.states_hash.as_ref()
    }

    pub fn confirmed_at(&self) -> &DateTime<Utc> {
        &self.confirmed_at
    }

    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }

    pub fn is_valid(&self) -> Result<(), String> {
        if self.proposal.is_empty() {
            return Err("empty proposal hash".to_string());
        }
        if self.height > Height::new(0) && self.previous_block.is_empty() {
            return Err("empty previous block hash".to_string());
        }
        if self.hash != self.generate_hash() {
            return Err("manifest hash does not match".to_string());
        }

        Ok(())
    }
}

/// The suffrage that voted on a block and the node that proposed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageInfo {
    #[serde(rename = "_hint")]
    hint: Hint,
    proposer: Address,
    nodes: Vec<Address>,
}

impl SuffrageInfo {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x11]), 0, 0, 1);

    pub fn new(proposer: Address, nodes: Vec<Address>) -> Self {
        Self {
            hint: Self::HINT,
            proposer,
            nodes,
        }
    }

    pub fn proposer(&self) -> &Address {
        &self.proposer
    }

    pub fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.contains(address)
    }

    pub fn is_valid(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("empty suffrage nodes".to_string());
        }
        if !self.contains(&self.proposer) {
            return Err(format!("proposer {} not in suffrage", self.proposer));
        }

        Ok(())
    }
}

/// Certificates and metadata that justify a block.
#[derive(Clone, Debug)]
pub struct ConsensusInfo {
    pub init_voteproof: Voteproof,
    pub accept_voteproof: Option<Voteproof>,
    pub suffrage_info: SuffrageInfo,
    pub proposal: Proposal,
}

impl ConsensusInfo {
    pub fn is_valid(&self) -> Result<(), String> {
        self.suffrage_info.is_valid()?;

        check_voteproof(&self.init_voteproof, Stage::Init, &self.suffrage_info)?;
        if let Some(accept_voteproof) = &self.accept_voteproof {
            check_voteproof(accept_voteproof, Stage::Accept, &self.suffrage_info)?;
        }

        Ok(())
    }
}

fn check_voteproof(voteproof: &Voteproof, stage: Stage, suffrage: &SuffrageInfo) -> Result<(), String> {
    if voteproof.stage() != stage {
        return Err(format!("not {} voteproof, {}", stage, voteproof.stage()));
    }
    voteproof.is_valid()?;
    if let Some(voter) = voteproof.voters().find(|voter| !suffrage.contains(voter)) {
        return Err(format!("voter {} not in suffrage", voter));
    }

    Ok(())
}

#[derive(Clone, Debug)]
pub struct Block {
    pub manifest: Manifest,
    pub consensus_info: ConsensusInfo,
    pub operations: Vec<Arc<dyn Operation>>,
    pub operations_tree: FixedTree,
    pub states: Vec<State>,
    pub states_tree: FixedTree,
}

impl Block {
    pub fn hash(&self) -> &ValueHash {
        self.manifest.hash()
    }

    pub fn height(&self) -> Height {
        self.manifest.height()
    }

    pub fn round(&self) -> Round {
        self.manifest.round()
    }

    pub fn is_valid(&self) -> Result<(), String> {
        self.manifest.is_valid()?;
        self.consensus_info.is_valid()?;

        if self.consensus_info.proposal.hash() != self.manifest.proposal() {
            return Err("proposal does not match manifest".to_string());
        }
        check_voteproof_point(&self.consensus_info.init_voteproof, &self.manifest)?;
        if let Some(accept_voteproof) = &self.consensus_info.accept_voteproof {
            check_voteproof_point(accept_voteproof, &self.manifest)?;
        }

        check_tree_root(&self.operations_tree, self.manifest.operations_hash(), "operations")?;
        check_tree_root(&self.states_tree, self.manifest.states_hash(), "states")?;

        if self.states.len() != self.states_tree.len() {
            return Err("states do not match states tree".to_string());
        }
        for state in &self.states {
            state.is_valid()?;
        }

        Ok(())
    }
}

fn check_voteproof_point(voteproof: &Voteproof, manifest: &Manifest) -> Result<(), String> {
    if voteproof.height() != manifest.height() || voteproof.round() != manifest.round() {
        return Err(format!(
            "{} voteproof does not match manifest; voteproof={}/{} manifest={}/{}",
            voteproof.stage(),
            voteproof.height(),
            voteproof.round(),
            manifest.height(),
            manifest.round()
        ));
    }

    Ok(())
}

fn check_tree_root(tree: &FixedTree, root: Option<&ValueHash>, name: &str) -> Result<(), String> {
    match root {
        None if tree.is_empty() => Ok(()),
        None => Err(format!("{} tree given but manifest has no {} hash", name, name)),
        Some(root) => {
            tree.is_valid().map_err(|err| err.to_string())?;
            if tree.root() != Some(root.bytes()) {
                return Err(format!("{} hash does not match tree root", name));
            }
            Ok(())
        }
    }
}
