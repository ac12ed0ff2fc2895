/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Turning proposals into blocks.
//!
//! A [`Processor`] owns the work for exactly one proposal: it prepares the block after the INIT
//! voteproof and saves it after the ACCEPT voteproof. The [`Supervisor`] decides which processor is
//! current, runs prepare and save in the background with retries, and reports each request's outcome as
//! a single [`ProcessResult`].
//!
//! ## Processor lifecycle
//!
//! ```text
//! BeforePrepared ──► Preparing ──► Prepared ──► Saving ──► Saved
//!                        │                        │
//!                        ▼                        ▼
//!                  PrepareFailed              SaveFailed
//! ```
//!
//! Any state except `Saved` may move to `Canceled`, after which no further transitions are accepted.
//! Cancelling a `Saved` processor does nothing.

pub mod default;

pub mod supervisor;

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::{
    block_data::BlockDataError,
    context::{Context, ContextError},
    database::DatabaseError,
    operations::OperationsError,
    retry::RetryError,
    types::{basic::Stage, block::Block, proposal::Proposal, voteproof::Voteproof},
};

pub use default::{DefaultProcessor, DefaultProcessorConfiguration};
pub use supervisor::{Supervisor, SupervisorConfiguration};

/// Where a processor is in its lifecycle. States are ordered, so "before Prepared" is meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessorState {
    BeforePrepared,
    Preparing,
    PrepareFailed,
    Prepared,
    Saving,
    SaveFailed,
    Saved,
    Canceled,
}

impl ProcessorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorState::BeforePrepared => "BeforePrepared",
            ProcessorState::Preparing => "Preparing",
            ProcessorState::PrepareFailed => "PrepareFailed",
            ProcessorState::Prepared => "Prepared",
            ProcessorState::Saving => "Saving",
            ProcessorState::SaveFailed => "SaveFailed",
            ProcessorState::Saved => "Saved",
            ProcessorState::Canceled => "Canceled",
        }
    }
}

impl Display for ProcessorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one supervisor request.
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub block: Option<Block>,
    pub err: Option<ProcessError>,
}

impl ProcessResult {
    pub fn ok(block: Option<Block>) -> Self {
        Self { block, err: None }
    }

    pub fn err(err: ProcessError) -> Self {
        Self {
            block: None,
            err: Some(err),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_none() && self.err.is_none()
    }
}

/// Processes a single proposal.
///
/// Implementations manage their own [`ProcessorState`]: `prepare` moves through `Preparing` to
/// `Prepared` or `PrepareFailed`, `save` through `Saving` to `Saved` or `SaveFailed`, and `cancel` to
/// `Canceled`. `Saved` and `Canceled` are final: `cancel` leaves a `Saved` processor alone.
pub trait Processor: Send + Sync {
    fn state(&self) -> ProcessorState;

    fn proposal(&self) -> &Proposal;

    /// Build the block. `Ok(None)` means the proposal was processed but produced no block.
    fn prepare(&self, ctx: &Context) -> Result<Option<Block>, ProcessError>;

    fn set_accept_voteproof(&self, voteproof: Voteproof) -> Result<(), ProcessError>;

    /// Seal and commit the prepared block.
    fn save(&self, ctx: &Context) -> Result<(), ProcessError>;

    fn cancel(&self) -> Result<(), ProcessError>;

    /// The prepared block, if any.
    fn block(&self) -> Option<Block>;
}

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The request had no effect and needs no attention.
    #[error("ignored; {0}")]
    Ignored(String),
    #[error("failed to prepare; {0}")]
    PrepareFailed(Box<ProcessError>),
    #[error("failed to save; {0}")]
    SaveFailed(Box<ProcessError>),
    /// Ends a retry loop early.
    #[error(transparent)]
    StopRetrying(Box<ProcessError>),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("not valid voteproof, {0}")]
    InvalidVoteproof(Stage),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Operations(#[from] OperationsError),
    #[error(transparent)]
    BlockData(#[from] BlockDataError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ProcessError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ProcessError::Failed(msg.into())
    }

    pub fn ignored(msg: impl Into<String>) -> Self {
        ProcessError::Ignored(msg.into())
    }

    fn inner(&self) -> Option<&ProcessError> {
        match self {
            ProcessError::PrepareFailed(err) | ProcessError::SaveFailed(err) | ProcessError::StopRetrying(err) => {
                Some(err)
            }
            _ => None,
        }
    }

    /// Whether this error, or any error it wraps, is [`ProcessError::Ignored`].
    pub fn is_ignored(&self) -> bool {
        match self {
            ProcessError::Ignored(_) => true,
            _ => self.inner().is_some_and(ProcessError::is_ignored),
        }
    }

    /// The context error this error wraps, if any.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            ProcessError::Context(err) => Some(*err),
            _ => self.inner().and_then(ProcessError::context_error),
        }
    }

    pub fn is_context(&self) -> bool {
        self.context_error().is_some()
    }

    pub fn is_prepare_failed(&self) -> bool {
        matches!(self, ProcessError::PrepareFailed(_))
    }

    pub fn is_save_failed(&self) -> bool {
        matches!(self, ProcessError::SaveFailed(_))
    }
}

impl RetryError for ProcessError {
    fn is_stop_retrying(&self) -> bool {
        matches!(self, ProcessError::StopRetrying(_))
    }

    fn stop_retrying(self) -> Self {
        match self {
            ProcessError::StopRetrying(_) => self,
            err => ProcessError::StopRetrying(Box::new(err)),
        }
    }

    fn from_context(err: ContextError) -> Self {
        ProcessError::Context(err)
    }
}
