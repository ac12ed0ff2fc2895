/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Vote certificates.
//!
//! The processing core treats a [`Voteproof`] mostly opaquely: it checks its stage when one is handed to
//! the supervisor or to a block-data session, and, when one is embedded in a block, that every voter is a
//! member of the block's suffrage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    basic::{Address, Height, Round, Stage},
    crypto_primitives::ValueHash,
    hint::{Hint, HintType},
};

/// Outcome of a voting stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteResult {
    NotYetMajority,
    Draw,
    Majority,
}

/// A single signed vote included in a voteproof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteproofNodeFact {
    pub address: Address,
    pub ballot: ValueHash,
    pub fact: ValueHash,
    #[serde(with = "hex")]
    pub signer: Vec<u8>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voteproof {
    #[serde(rename = "_hint")]
    hint: Hint,
    height: Height,
    round: Round,
    stage: Stage,
    threshold: u64,
    result: VoteResult,
    majority: Option<ValueHash>,
    ballots: BTreeMap<Address, ValueHash>,
    votes: Vec<VoteproofNodeFact>,
    finished_at: DateTime<Utc>,
}

impl Voteproof {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x20]), 0, 0, 1);

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        height: Height,
        round: Round,
        stage: Stage,
        threshold: u64,
        result: VoteResult,
        majority: Option<ValueHash>,
        votes: Vec<VoteproofNodeFact>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let ballots = votes
            .iter()
            .map(|vote| (vote.address.clone(), vote.ballot.clone()))
            .collect();

        Self {
            hint: Self::HINT,
            height,
            round,
            stage,
            threshold,
            result,
            majority,
            ballots,
            votes,
            finished_at,
        }
    }

    pub fn hint(&self) -> &Hint {
        &self.hint
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn result(&self) -> VoteResult {
        self.result
    }

    pub fn majority(&self) -> Option<&ValueHash> {
        self.majority.as_ref()
    }

    pub fn ballots(&self) -> &BTreeMap<Address, ValueHash> {
        &self.ballots
    }

    pub fn votes(&self) -> &[VoteproofNodeFact] {
        &self.votes
    }

    pub fn finished_at(&self) -> &DateTime<Utc> {
        &self.finished_at
    }

    /// Every address that appears in the voteproof, either as a ballot or as a vote.
    pub fn voters(&self) -> impl Iterator<Item = &Address> {
        self.ballots
            .keys()
            .chain(self.votes.iter().map(|vote| &vote.address))
    }

    /// Structural checks that do not need the suffrage.
    pub fn is_valid(&self) -> Result<(), String> {
        if self.result == VoteResult::Majority && self.majority.is_none() {
            return Err("majority voteproof without majority fact".to_string());
        }
        if let Some(vote) = self.votes.iter().find(|vote| !self.ballots.contains_key(&vote.address)) {
            return Err(format!("vote from {} has no ballot", vote.address));
        }

        Ok(())
    }
}
