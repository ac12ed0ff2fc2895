/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The contract between the processing core and application-defined operations.
//!
//! The core is agnostic to what an operation means. It only needs to know an operation's identity
//! ([`fact_hash`](Operation::fact_hash)), its transport hash, its [`Hint`], and how to run it against the
//! block's [`StatePool`].

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_pool::{StatePool, StatePoolError};

use super::{
    crypto_primitives::ValueHash,
    hint::{Hint, HintSet},
};

pub trait Operation: Send + Sync {
    fn hint(&self) -> &Hint;

    /// Hash of the transport envelope.
    fn hash(&self) -> &ValueHash;

    /// Hash of the immutable payload. This is the operation's identity inside a block.
    fn fact_hash(&self) -> &ValueHash;

    /// Validation against committed state, run before the operation is queued for execution.
    fn pre_process(&self, _pool: &StatePool) -> Result<(), OperationError> {
        Ok(())
    }

    /// Apply the operation, staging its state updates through [`StatePool::set`].
    fn process(&self, pool: &StatePool) -> Result<(), OperationError>;

    /// JSON record of the operation. Must carry the operation's hint in a `_hint` field so that it can
    /// be routed back to a decoder.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("hint", self.hint())
            .field("fact_hash", self.fact_hash())
            .finish()
    }
}

pub type OperationDecoder = fn(serde_json::Value) -> Result<Arc<dyn Operation>, serde_json::Error>;

/// Decoders for operation records, routed by hint.
pub type OperationDecoders = HintSet<OperationDecoder>;

/// Decode an operation record through the decoder registered for its `_hint`.
pub fn decode_operation(
    decoders: &OperationDecoders,
    record: serde_json::Value,
) -> Result<Arc<dyn Operation>, OperationError> {
    let hint: Hint = record
        .get("_hint")
        .cloned()
        .ok_or_else(|| OperationError::Other("operation record without _hint".to_string()))
        .and_then(|hint| {
            serde_json::from_value(hint).map_err(|err| OperationError::Other(err.to_string()))
        })?;

    let decoder = decoders
        .compatible(&hint)
        .ok_or_else(|| OperationError::Other(format!("no decoder for operation hint, {}", hint)))?;

    decoder(record).map_err(|err| OperationError::Other(err.to_string()))
}

/// Business-level failure of an operation. It is recorded in the operations tree and never fails the
/// block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{msg}")]
pub struct ReasonError {
    msg: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    data: BTreeMap<String, serde_json::Value>,
}

impl ReasonError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }
}

#[derive(Clone, Debug, Error)]
pub enum OperationError {
    /// The operation is skipped; it ends up in the operations tree as not in state.
    #[error("ignored; {0}")]
    Ignored(String),
    #[error(transparent)]
    Reason(#[from] ReasonError),
    #[error("operation processor already closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

impl OperationError {
    /// Ignored and reason errors do not fail the batch.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, OperationError::Ignored(_) | OperationError::Reason(_))
    }

    /// The reason recorded in the operations tree for an ignorable error.
    pub fn reason(&self) -> ReasonError {
        match self {
            OperationError::Reason(reason) => reason.clone(),
            OperationError::Ignored(msg) => ReasonError::new(msg.clone()),
            other => ReasonError::new(other.to_string()),
        }
    }
}

impl From<StatePoolError> for OperationError {
    fn from(err: StatePoolError) -> Self {
        OperationError::Other(err.to_string())
    }
}
