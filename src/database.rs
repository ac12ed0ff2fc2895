/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable durable storage.
//!
//! The processing core reads committed state and staged operations from, and commits finished blocks
//! to, a [`Database`]. Any key-value engine can implement it; the core makes no assumption about how the
//! data is laid out.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    block_data::map::BlockDataMap,
    types::{block::Block, block::Manifest, crypto_primitives::ValueHash, operation::Operation, state::State},
};

pub trait Database: Send + Sync {
    /// Manifest of the highest committed block, or `None` before genesis.
    fn last_manifest(&self) -> Result<Option<Manifest>, DatabaseError>;

    /// Committed value of a state.
    fn state(&self, key: &str) -> Result<Option<State>, DatabaseError>;

    /// Whether an operation with this fact hash is already in a committed block.
    fn has_operation_fact(&self, fact: &ValueHash) -> Result<bool, DatabaseError>;

    /// An operation waiting to be included in a block, by operation hash.
    fn staged_operation(&self, hash: &ValueHash) -> Result<Option<Arc<dyn Operation>>, DatabaseError>;

    /// Durably store a block and the map of its block data.
    fn commit(&self, block: &Block, map: &BlockDataMap) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("not found; {0}")]
    NotFound(String),
    #[error("database error; {0}")]
    Other(String),
}
