//! Proposals, voteproofs and blocks for tests.

use blockproc_rs::{
    fixed_tree::FixedTree,
    types::{
        basic::{Address, Height, Round, Stage},
        block::{Block, ConsensusInfo, Manifest, SuffrageInfo},
        crypto_primitives::{Keypair, SigningKey, ValueHash},
        proposal::{Proposal, ProposalFact},
        voteproof::{VoteResult, Voteproof, VoteproofNodeFact},
    },
};
use chrono::Utc;
use rand_core::OsRng;

/// Number of nodes in the test suffrage.
pub(crate) const SUFFRAGE_SIZE: usize = 3;

pub(crate) fn keypair() -> Keypair {
    let mut csprg = OsRng {};
    Keypair::new(SigningKey::generate(&mut csprg))
}

/// Addresses of the test suffrage. The first one proposes every test proposal.
pub(crate) fn suffrage_nodes() -> Vec<Address> {
    (0..SUFFRAGE_SIZE).map(|i| Address::new(format!("node-{}", i))).collect()
}

pub(crate) fn proposal(height: i64, round: u64, operations: Vec<ValueHash>) -> Proposal {
    let fact = ProposalFact::new(
        Height::new(height),
        Round::new(round),
        suffrage_nodes()[0].clone(),
        operations,
    );
    Proposal::sign(fact, &keypair())
}

/// A majority voteproof in which every suffrage node voted.
pub(crate) fn voteproof(height: i64, round: u64, stage: Stage) -> Voteproof {
    let majority = ValueHash::sha256(&[
        stage.bytes(),
        height.to_le_bytes().as_slice(),
        round.to_le_bytes().as_slice(),
    ]);
    let votes = suffrage_nodes()
        .into_iter()
        .map(|address| VoteproofNodeFact {
            ballot: ValueHash::sha256(&[address.bytes(), majority.bytes()]),
            fact: majority.clone(),
            address,
            signer: vec![0; 32],
            signature: vec![0; 64],
        })
        .collect();

    Voteproof::new(
        Height::new(height),
        Round::new(round),
        stage,
        67,
        VoteResult::Majority,
        Some(majority),
        votes,
        Utc::now(),
    )
}

pub(crate) fn init_voteproof(height: i64, round: u64) -> Voteproof {
    voteproof(height, round, Stage::Init)
}

pub(crate) fn accept_voteproof(height: i64, round: u64) -> Voteproof {
    voteproof(height, round, Stage::Accept)
}

/// A valid block without operations or states for `proposal`.
pub(crate) fn empty_block(proposal: &Proposal, init_voteproof: &Voteproof) -> Block {
    let manifest = Manifest::new(
        proposal.height(),
        proposal.round(),
        proposal.hash().clone(),
        ValueHash::sha256(&[b"previous block".as_slice()]),
        None,
        None,
        *init_voteproof.finished_at(),
    );

    Block {
        manifest,
        consensus_info: ConsensusInfo {
            init_voteproof: init_voteproof.clone(),
            accept_voteproof: None,
            suffrage_info: SuffrageInfo::new(suffrage_nodes()[0].clone(), suffrage_nodes()),
            proposal: proposal.clone(),
        },
        operations: Vec::new(),
        operations_tree: FixedTree::empty(),
        states: Vec::new(),
        states_tree: FixedTree::empty(),
    }
}
