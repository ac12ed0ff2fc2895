/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block-proposal processing core of a BFT node.
//!
//! Given a signed proposal and the INIT voteproof that justifies it, a node executes the proposal's
//! operations, builds the block, and writes the block's data to disk. Once the ACCEPT voteproof
//! arrives, the block is sealed and committed.
//!
//! - [`proposal_processor`]: the [`Supervisor`](proposal_processor::Supervisor) that keeps at most one
//!   live processor, and the [`DefaultProcessor`](proposal_processor::DefaultProcessor) that turns a
//!   proposal into a block.
//! - [`operations`]: parallel execution of a block's operations.
//! - [`fixed_tree`]: the fixed-size Merkle tree used for the operations and states roots.
//! - [`block_data`]: content-addressed block data files on the local filesystem.

pub mod block_data;

pub mod context;

pub mod database;

pub mod fixed_tree;

pub mod logging;

pub mod operations;

pub mod proposal_processor;

pub mod retry;

pub mod state_pool;

pub mod types;
