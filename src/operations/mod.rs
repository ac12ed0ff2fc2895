/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Execution of a block's operations.
//!
//! Operations are executed through [`OperationProcessor`]s. Applications can register a processor
//! factory per operation [`Hint`] in an [`OperationProcessorSet`]; operations without a registered
//! factory run through the [`DefaultOperationProcessor`], which simply calls into the operation itself.
//! The [`ConcurrentOperationsProcessor`](concurrent::ConcurrentOperationsProcessor) runs one block's
//! operations on a bounded worker pool and builds the block's operations and states trees.

pub mod concurrent;

use std::sync::Arc;

use crate::{
    state_pool::StatePool,
    types::{
        hint::{Hint, HintError, HintSet},
        operation::{Operation, OperationError},
    },
};

pub use concurrent::{ConcurrentOperationsProcessor, OperationLeafExtra, OperationsError, MAX_CONCURRENT_OPERATIONS};

/// Runs operations of one type for one block. A processor sees exactly one lifecycle: any number of
/// `pre_process` / `process` calls, then either `close` or `cancel`.
pub trait OperationProcessor: Send + Sync {
    /// Validate `operation` before it is queued. May return a different operation to execute.
    fn pre_process(&self, operation: Arc<dyn Operation>) -> Result<Arc<dyn Operation>, OperationError>;

    fn process(&self, operation: &dyn Operation) -> Result<(), OperationError>;

    fn close(&self) -> Result<(), OperationError>;

    fn cancel(&self) -> Result<(), OperationError>;
}

/// Creates the per-block [`OperationProcessor`] for one operation type.
pub trait OperationProcessorFactory: Send + Sync {
    fn new_processor(&self, pool: Arc<StatePool>) -> Result<Arc<dyn OperationProcessor>, OperationError>;
}

/// Pass-through processor: runs the operation's own pre-process and process against the pool.
pub struct DefaultOperationProcessor {
    pool: Arc<StatePool>,
}

impl DefaultOperationProcessor {
    pub fn new(pool: Arc<StatePool>) -> Self {
        Self { pool }
    }
}

impl OperationProcessor for DefaultOperationProcessor {
    fn pre_process(&self, operation: Arc<dyn Operation>) -> Result<Arc<dyn Operation>, OperationError> {
        operation.pre_process(&self.pool)?;
        Ok(operation)
    }

    fn process(&self, operation: &dyn Operation) -> Result<(), OperationError> {
        operation.process(&self.pool)
    }

    fn close(&self) -> Result<(), OperationError> {
        Ok(())
    }

    fn cancel(&self) -> Result<(), OperationError> {
        Ok(())
    }
}

/// Registry of operation processor factories, keyed by operation hint.
#[derive(Default)]
pub struct OperationProcessorSet {
    factories: HintSet<Arc<dyn OperationProcessorFactory>>,
}

impl OperationProcessorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        hint: Hint,
        factory: impl OperationProcessorFactory + 'static,
    ) -> Result<(), HintError> {
        self.factories.add(hint, Arc::new(factory))
    }

    /// The registered hint and factory that can handle operations tagged with `hint`.
    pub fn resolve(&self, hint: &Hint) -> Option<(&Hint, &Arc<dyn OperationProcessorFactory>)> {
        self.factories.compatible_entry(hint)
    }
}
