/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The types and traits defined in [`crate::types`] are common across the components of the processing
//! core: the proposal supervisor, the concurrent operations processor and the block-data layer.
//!
//! Every type that is persisted carries a [`Hint`](hint::Hint) in its `_hint` field.

pub mod basic;

pub mod block;

pub mod crypto_primitives;

pub mod hint;

pub mod operation;

pub mod proposal;

pub mod state;

pub mod voteproof;
