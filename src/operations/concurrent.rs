/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Parallel execution of one block's operations.
//!
//! ## Flow
//!
//! 1. For every input, [`process`](ConcurrentOperationsProcessor::process) resolves the operation
//!    processor for the operation's hint (cached per batch) and runs its pre-process synchronously.
//! 2. Operations that pass pre-process are queued to a pool of `min(max, 500)` worker threads. Each
//!    worker runs one operation to completion, records its outcome leaf at the input index, and picks
//!    the next job.
//! 3. [`close`](ConcurrentOperationsProcessor::close) waits for the workers and closes every resolved
//!    processor. The block's trees are then available through
//!    [`operations_tree`](ConcurrentOperationsProcessor::operations_tree) and
//!    [`states_tree`](ConcurrentOperationsProcessor::states_tree).
//!
//! ## Failures
//!
//! Ignored and reason errors are business-level failures: the operation gets a leaf with
//! `in_state = false` and the reason, and the batch continues. Any other error ends the batch: the
//! remaining jobs are drained without running, later `process` calls fail with
//! [`OperationError::Closed`], and every resolved processor is cancelled.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    fixed_tree::{FixedTree, FixedTreeGenerator, TreeError},
    logging::debug,
    state_pool::StatePool,
    types::{
        hint::Hint,
        operation::{Operation, OperationError, ReasonError},
        state::State,
    },
};

use super::{DefaultOperationProcessor, OperationProcessor, OperationProcessorSet};

/// Upper bound on concurrently executing operations.
pub const MAX_CONCURRENT_OPERATIONS: usize = 500;

/// The `extra` of an operations tree leaf: whether the operation made it into the block's state and, if
/// not, why.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLeafExtra {
    pub in_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonError>,
}

impl OperationLeafExtra {
    pub fn encode(&self) -> Result<Vec<u8>, OperationsError> {
        serde_json::to_vec(self).map_err(|err| OperationsError::Encode(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OperationsError> {
        serde_json::from_slice(bytes).map_err(|err| OperationsError::Encode(err.to_string()))
    }
}

struct Job {
    index: u64,
    operation: Arc<dyn Operation>,
    fact: Vec<u8>,
    processor: Arc<dyn OperationProcessor>,
}

type Leaves = Mutex<Vec<Option<(Vec<u8>, Vec<u8>)>>>;

/// State shared between the processor and its workers.
struct Shared {
    leaves: Leaves,
    canceled: AtomicBool,
    first_error: Mutex<Option<OperationError>>,
}

impl Shared {
    fn record(&self, index: u64, fact: Vec<u8>, reason: Option<ReasonError>) -> Result<(), OperationsError> {
        let extra = OperationLeafExtra {
            in_state: reason.is_none(),
            reason,
        }
        .encode()?;

        let mut leaves = lock(&self.leaves);
        let size = leaves.len() as u64;
        let slot = leaves
            .get_mut(index as usize)
            .ok_or(OperationsError::Tree(TreeError::OutOfRange { index, size }))?;
        *slot = Some((fact, extra));
        Ok(())
    }

    fn fail(&self, err: OperationError) {
        let mut first_error = lock(&self.first_error);
        if first_error.is_none() {
            *first_error = Some(err);
        }
        self.canceled.store(true, Ordering::Release);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

struct WorkerPool {
    jobs: SyncSender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(workers: usize, shared: Arc<Shared>) -> WorkerPool {
        let (jobs, receiver) = mpsc::sync_channel::<Job>(workers);
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers)
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                let shared = Arc::clone(&shared);
                thread::spawn(move || work(receiver, shared))
            })
            .collect();

        WorkerPool { jobs, handles }
    }

    /// Stop accepting jobs and wait for the workers to drain the queue.
    fn join(self) {
        drop(self.jobs);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("operation worker panicked");
            }
        }
    }
}

fn work(receiver: Arc<Mutex<Receiver<Job>>>, shared: Arc<Shared>) {
    loop {
        let job = match lock(&receiver).recv() {
            Ok(job) => job,
            Err(_) => return,
        };
        if shared.is_canceled() {
            continue;
        }

        let reason = match job.processor.process(job.operation.as_ref()) {
            Ok(()) => None,
            Err(err) if err.is_ignorable() => Some(err.reason()),
            Err(err) => {
                debug::operation_failed(job.operation.fact_hash(), &err);
                shared.fail(err);
                continue;
            }
        };

        if let Err(err) = shared.record(job.index, job.fact, reason) {
            shared.fail(OperationError::Other(err.to_string()));
        }
    }
}

/// Executes a known number of operations in parallel and builds the block's trees from the outcome.
pub struct ConcurrentOperationsProcessor {
    size: u64,
    pool: Arc<StatePool>,
    processors: Arc<OperationProcessorSet>,
    resolved: Mutex<HashMap<Option<Hint>, Arc<dyn OperationProcessor>>>,
    shared: Arc<Shared>,
    workers: Mutex<Option<WorkerPool>>,
    closed: AtomicBool,
}

impl ConcurrentOperationsProcessor {
    /// A processor for `size` operations with at most `max` of them (capped at
    /// [`MAX_CONCURRENT_OPERATIONS`]) running at once.
    pub fn new(
        size: u64,
        max: usize,
        pool: Arc<StatePool>,
        processors: Arc<OperationProcessorSet>,
    ) -> Result<Self, OperationsError> {
        if max < 1 {
            return Err(OperationsError::InvalidInput(format!(
                "max must be greater than 0, {}",
                max
            )));
        }

        let workers = max
            .min(MAX_CONCURRENT_OPERATIONS)
            .min(usize::try_from(size).unwrap_or(usize::MAX))
            .max(1);

        let shared = Arc::new(Shared {
            leaves: Mutex::new(vec![None; size as usize]),
            canceled: AtomicBool::new(false),
            first_error: Mutex::new(None),
        });

        Ok(Self {
            size,
            pool,
            processors,
            resolved: Mutex::new(HashMap::new()),
            workers: Mutex::new(Some(WorkerPool::start(workers, Arc::clone(&shared)))),
            shared,
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pool(&self) -> &Arc<StatePool> {
        &self.pool
    }

    /// Pre-process `operation` and queue it for execution at tree position `index`.
    pub fn process(&self, index: u64, operation: Arc<dyn Operation>) -> Result<(), OperationsError> {
        if self.closed.load(Ordering::Acquire) || self.shared.is_canceled() {
            return Err(OperationError::Closed.into());
        }
        if index >= self.size {
            return Err(TreeError::OutOfRange {
                index,
                size: self.size,
            }
            .into());
        }

        let fact = operation.fact_hash().bytes().to_vec();
        let processor = self.resolve(operation.hint())?;

        let operation = match processor.pre_process(operation) {
            Ok(operation) => operation,
            Err(err) if err.is_ignorable() => {
                return self.shared.record(index, fact, Some(err.reason()));
            }
            Err(err) => {
                self.shared.record(index, fact, Some(err.reason()))?;
                return Err(err.into());
            }
        };

        let jobs = lock(&self.workers)
            .as_ref()
            .map(|workers| workers.jobs.clone())
            .ok_or(OperationError::Closed)?;
        jobs.send(Job {
            index,
            operation,
            fact,
            processor,
        })
        .map_err(|_| OperationError::Closed)?;

        Ok(())
    }

    /// Mark the operation at `index` as not executed, with `reason`, without running it.
    pub fn skip(&self, index: u64, fact: Vec<u8>, reason: ReasonError) -> Result<(), OperationsError> {
        self.shared.record(index, fact, Some(reason))
    }

    fn resolve(&self, hint: &Hint) -> Result<Arc<dyn OperationProcessor>, OperationsError> {
        let registered = self.processors.resolve(hint);
        let key = registered.map(|(registered, _)| registered.clone());

        let mut resolved = lock(&self.resolved);
        if let Some(processor) = resolved.get(&key) {
            return Ok(Arc::clone(processor));
        }

        let processor = match registered {
            Some((_, factory)) => factory.new_processor(Arc::clone(&self.pool))?,
            None => Arc::new(DefaultOperationProcessor::new(Arc::clone(&self.pool))),
        };
        resolved.insert(key, Arc::clone(&processor));

        Ok(processor)
    }

    fn resolved_processors(&self) -> Vec<Arc<dyn OperationProcessor>> {
        lock(&self.resolved).values().cloned().collect()
    }

    /// Wait for queued operations to finish and close every resolved processor. If a worker hit a fatal
    /// error, the resolved processors are cancelled instead and that error is returned.
    pub fn close(&self) -> Result<(), OperationsError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(workers) = lock(&self.workers).take() {
            workers.join();
        }

        if let Some(err) = lock(&self.shared.first_error).clone() {
            self.cancel_processors();
            return Err(err.into());
        }

        let processors = self.resolved_processors();
        let results: Vec<Result<(), OperationError>> = thread::scope(|scope| {
            let handles: Vec<_> = processors
                .iter()
                .map(|processor| scope.spawn(move || processor.close()))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(OperationError::Other("processor close panicked".to_string())))
                })
                .collect()
        });

        results.into_iter().collect::<Result<(), _>>()?;
        Ok(())
    }

    /// Stop the workers without running queued operations and cancel every resolved processor.
    pub fn cancel(&self) -> Result<(), OperationsError> {
        self.shared.canceled.store(true, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        if let Some(workers) = lock(&self.workers).take() {
            workers.join();
        }

        self.cancel_processors();
        Ok(())
    }

    fn cancel_processors(&self) {
        for processor in self.resolved_processors() {
            if let Err(err) = processor.cancel() {
                log::error!("failed to cancel operation processor; {}", err);
            }
        }
    }

    /// Operations created as side effects during execution, in the order they are appended to the
    /// operations tree.
    pub fn added_operations(&self) -> Vec<Arc<dyn Operation>> {
        self.pool.added_operations()
    }

    /// The operations tree: one leaf per input at its input index, followed by one leaf per added
    /// operation at contiguous indices starting at `size`.
    pub fn operations_tree(&self) -> Result<FixedTree, OperationsError> {
        let added = self.added_operations();
        let generator = FixedTreeGenerator::new(self.size + added.len() as u64);

        let leaves = lock(&self.shared.leaves).clone();
        for (index, leaf) in leaves.into_iter().enumerate() {
            let (key, extra) = leaf.ok_or(TreeError::EmptyNodeInTree(index as u64))?;
            generator.add(index as u64, key, extra)?;
        }

        let in_state = OperationLeafExtra {
            in_state: true,
            reason: None,
        }
        .encode()?;
        for (offset, operation) in added.iter().enumerate() {
            generator.add(
                self.size + offset as u64,
                operation.fact_hash().bytes().to_vec(),
                in_state.clone(),
            )?;
        }

        Ok(generator.tree()?)
    }

    /// The states staged in the pool, sorted by hash bytes, and the tree of their hashes.
    pub fn states_tree(&self) -> Result<(FixedTree, Vec<State>), OperationsError> {
        let mut states = self.pool.updates();
        for state in &states {
            state.is_valid().map_err(OperationsError::InvalidState)?;
        }
        states.sort_by(|a, b| a.hash().bytes().cmp(b.hash().bytes()));

        let generator = FixedTreeGenerator::new(states.len() as u64);
        for (index, state) in states.iter().enumerate() {
            generator.add(index as u64, state.hash().bytes().to_vec(), Vec::new())?;
        }

        Ok((generator.tree()?, states))
    }
}

impl Drop for ConcurrentOperationsProcessor {
    fn drop(&mut self) {
        if let Some(workers) = lock(&self.workers).take() {
            self.shared.canceled.store(true, Ordering::Release);
            workers.join();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Error)]
pub enum OperationsError {
    #[error("invalid input; {0}")]
    InvalidInput(String),
    #[error("invalid state; {0}")]
    InvalidState(String),
    #[error("failed to encode operation leaf; {0}")]
    Encode(String),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl OperationsError {
    pub fn is_closed(&self) -> bool {
        matches!(self, OperationsError::Operation(OperationError::Closed))
    }
}
