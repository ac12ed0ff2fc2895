/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed block proposals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    basic::{Address, Height, Round},
    crypto_primitives::{verify_signature, Keypair, SignatureBytes, ValueHash, VerifyingKeyBytes},
    hint::{Hint, HintType},
};

/// The signed part of a proposal: which operations the proposer wants in the block at `height` and
/// `round`. Its hash is the proposal's identity throughout the processing core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFact {
    #[serde(rename = "_hint")]
    hint: Hint,
    hash: ValueHash,
    height: Height,
    round: Round,
    proposer: Address,
    operations: Vec<ValueHash>,
}

impl ProposalFact {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x30]), 0, 0, 1);

    pub fn new(height: Height, round: Round, proposer: Address, operations: Vec<ValueHash>) -> Self {
        let hash = Self::generate_hash(height, round, &proposer, &operations);
        Self {
            hint: Self::HINT,
            hash,
            height,
            round,
            proposer,
            operations,
        }
    }

    fn generate_hash(
        height: Height,
        round: Round,
        proposer: &Address,
        operations: &[ValueHash],
    ) -> ValueHash {
        let mut parts: Vec<Vec<u8>> = vec![
            Self::HINT.bytes(),
            height.to_le_bytes().to_vec(),
            round.to_le_bytes().to_vec(),
            proposer.bytes().to_vec(),
        ];
        parts.extend(operations.iter().map(|op| op.bytes().to_vec()));
        ValueHash::sha256(&parts)
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

    pub fn proposer(&self) -> &Address {
        &self.proposer
    }

    /// Hashes of the operations the proposal wants executed, in execution order.
    pub fn operations(&self) -> &[ValueHash] {
        &self.operations
    }

    pub fn is_valid(&self) -> bool {
        self.hash == Self::generate_hash(self.height, self.round, &self.proposer, &self.operations)
    }
}

/// A [`ProposalFact`] signed by its proposer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(rename = "_hint")]
    hint: Hint,
    fact: ProposalFact,
    #[serde(with = "hex")]
    signer: Vec<u8>,
    #[serde(with = "hex")]
    signature: Vec<u8>,
    signed_at: DateTime<Utc>,
}

impl Proposal {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x31]), 0, 0, 1);

    pub fn sign(fact: ProposalFact, keypair: &Keypair) -> Self {
        let signature: SignatureBytes = keypair.sign(fact.hash().bytes());
        Self {
            hint: Self::HINT,
            fact,
            signer: keypair.public().to_bytes().to_vec(),
            signature: signature.to_vec(),
            signed_at: Utc::now(),
        }
    }

    pub fn fact(&self) -> &ProposalFact {
        &self.fact
    }

    /// The proposal hash, i.e. the hash of its fact.
    pub fn hash(&self) -> &ValueHash {
        self.fact.hash()
    }

    pub fn height(&self) -> Height {
        self.fact.height()
    }

    pub fn round(&self) -> Round {
        self.fact.round()
    }

    pub fn signed_at(&self) -> &DateTime<Utc> {
        &self.signed_at
    }

    /// Checks the fact hash and the proposer's signature over it.
    pub fn is_valid(&self) -> Result<(), String> {
        if !self.fact.is_valid() {
            return Err("proposal fact hash does not match".to_string());
        }

        let signer: VerifyingKeyBytes = self
            .signer
            .as_slice()
            .try_into()
            .map_err(|_| "invalid signer length".to_string())?;
        let signature: SignatureBytes = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| "invalid signature length".to_string())?;

        verify_signature(&signer, self.fact.hash().bytes(), &signature)
            .map_err(|err| format!("invalid proposal signature; {}", err))
    }
}
