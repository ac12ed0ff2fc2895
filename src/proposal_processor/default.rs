/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`DefaultProcessor`] builds a real block out of a proposal.
//!
//! Prepare:
//! 1. Fetch the proposal's operations from the database's staging area.
//! 2. Execute them through a [`ConcurrentOperationsProcessor`]. Operations whose fact is already in a
//!    committed block are not executed and get a failed leaf.
//! 3. Build the operations and states trees, the manifest, and the block.
//! 4. Write every artifact of the block except the ACCEPT voteproof into a block-data session.
//!
//! Save:
//! 1. Write the ACCEPT voteproof and move the session into place. If that fails, the session is dropped
//!    and the next attempt writes the whole block into a new one.
//! 2. Commit the block and its block-data map to the database and become `Saved`, under the state lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use typed_builder::TypedBuilder;

use crate::{
    block_data::{BlockDataMap, LocalBlockData, Session},
    context::Context,
    database::{Database, DatabaseError},
    logging::info,
    operations::{ConcurrentOperationsProcessor, OperationProcessorSet, MAX_CONCURRENT_OPERATIONS},
    state_pool::StatePool,
    types::{
        basic::{Address, Height, Stage},
        block::{Block, ConsensusInfo, Manifest, SuffrageInfo},
        crypto_primitives::ValueHash,
        operation::{Operation, ReasonError},
        proposal::Proposal,
        voteproof::Voteproof,
    },
};

use super::{ProcessError, Processor, ProcessorState};

/// Reason recorded for operations whose fact is already committed.
pub const ALREADY_KNOWN_OPERATION: &str = "already known operation";

#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [DefaultProcessorConfiguration]. On the builder call the following
    methods to construct a valid [DefaultProcessorConfiguration].

    Required:
    - `.suffrage_nodes(...)`

    Optional:
    - `.max_concurrent_operations(...)`
"))]
pub struct DefaultProcessorConfiguration {
    #[builder(
        default = MAX_CONCURRENT_OPERATIONS,
        setter(doc = "Set how many operations may execute at once. Capped at 500. Defaults to 500.")
    )]
    pub max_concurrent_operations: usize,
    #[builder(setter(doc = "Set the nodes of the suffrage that votes on the blocks. Required."))]
    pub suffrage_nodes: Vec<Address>,
}

#[derive(Default)]
struct Work {
    accept_voteproof: Option<Voteproof>,
    block: Option<Block>,
    operations: Option<Arc<ConcurrentOperationsProcessor>>,
    session: Option<Arc<Session>>,
    map: Option<BlockDataMap>,
}

pub struct DefaultProcessor {
    config: DefaultProcessorConfiguration,
    proposal: Proposal,
    init_voteproof: Voteproof,
    database: Arc<dyn Database>,
    block_data: Arc<LocalBlockData>,
    processors: Arc<OperationProcessorSet>,
    state: RwLock<ProcessorState>,
    work: Mutex<Work>,
}

impl DefaultProcessor {
    pub fn new(
        config: DefaultProcessorConfiguration,
        proposal: Proposal,
        init_voteproof: Voteproof,
        database: Arc<dyn Database>,
        block_data: Arc<LocalBlockData>,
        processors: Arc<OperationProcessorSet>,
    ) -> Result<Self, ProcessError> {
        if init_voteproof.stage() != Stage::Init {
            return Err(ProcessError::InvalidVoteproof(init_voteproof.stage()));
        }
        if init_voteproof.height() != proposal.height() || init_voteproof.round() != proposal.round() {
            return Err(ProcessError::failed(format!(
                "init voteproof does not match proposal; voteproof={}/{} proposal={}/{}",
                init_voteproof.height(),
                init_voteproof.round(),
                proposal.height(),
                proposal.round()
            )));
        }

        Ok(Self {
            config,
            proposal,
            init_voteproof,
            database,
            block_data,
            processors,
            state: RwLock::new(ProcessorState::BeforePrepared),
            work: Mutex::new(Work::default()),
        })
    }

    /// A processor factory for [`Supervisor::new`](super::Supervisor::new).
    pub fn new_fn(
        config: DefaultProcessorConfiguration,
        database: Arc<dyn Database>,
        block_data: Arc<LocalBlockData>,
        processors: Arc<OperationProcessorSet>,
    ) -> impl Fn(&Proposal, &Voteproof) -> Result<Arc<dyn Processor>, ProcessError> + Send + 'static {
        move |proposal, init_voteproof| {
            let processor = DefaultProcessor::new(
                config.clone(),
                proposal.clone(),
                init_voteproof.clone(),
                Arc::clone(&database),
                Arc::clone(&block_data),
                Arc::clone(&processors),
            )?;
            Ok(Arc::new(processor) as Arc<dyn Processor>)
        }
    }

    /// Map of the saved block data, once saved.
    pub fn block_data_map(&self) -> Option<BlockDataMap> {
        self.work().map.clone()
    }

    fn work(&self) -> MutexGuard<'_, Work> {
        self.work.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `state`, unless the processor is already canceled.
    fn set_state(&self, state: ProcessorState) -> Result<(), ProcessError> {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current == ProcessorState::Canceled {
            return Err(ProcessError::failed("canceled"));
        }
        *current = state;
        Ok(())
    }

    /// Fail if the context is done or the processor was canceled meanwhile.
    fn check(&self, ctx: &Context) -> Result<(), ProcessError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        if self.state() == ProcessorState::Canceled {
            return Err(ProcessError::failed("canceled"));
        }
        Ok(())
    }

    fn fetch_operations(&self) -> Result<Vec<Arc<dyn Operation>>, ProcessError> {
        self.proposal
            .fact()
            .operations()
            .iter()
            .map(|hash| -> Result<Arc<dyn Operation>, ProcessError> {
                self.database
                    .staged_operation(hash)?
                    .ok_or_else(|| DatabaseError::NotFound(format!("staged operation, {}", hash)).into())
            })
            .collect()
    }

    fn build_block(&self, ctx: &Context) -> Result<Block, ProcessError> {
        self.check(ctx)?;

        let (height, previous_block) = match self.database.last_manifest()? {
            Some(last) => (last.height() + 1, last.hash().clone()),
            None => (Height::new(0), ValueHash::from_sha256_bytes(Vec::new())),
        };
        if height != self.proposal.height() {
            return Err(ProcessError::failed(format!(
                "proposal height does not follow the last block; expected={} proposal={}",
                height,
                self.proposal.height()
            )));
        }

        let mut operations = self.fetch_operations()?;
        self.check(ctx)?;

        // 1. Execute the operations.
        let database = Arc::clone(&self.database);
        let pool = Arc::new(StatePool::new(height, move |key| database.state(key)));
        let executor = Arc::new(ConcurrentOperationsProcessor::new(
            operations.len() as u64,
            self.config.max_concurrent_operations,
            Arc::clone(&pool),
            Arc::clone(&self.processors),
        )?);
        self.work().operations = Some(Arc::clone(&executor));

        for (index, operation) in operations.iter().enumerate() {
            self.check(ctx)?;

            if self.database.has_operation_fact(operation.fact_hash())? {
                executor.skip(
                    index as u64,
                    operation.fact_hash().bytes().to_vec(),
                    ReasonError::new(ALREADY_KNOWN_OPERATION),
                )?;
                continue;
            }
            executor.process(index as u64, Arc::clone(operation))?;
        }
        executor.close()?;
        self.check(ctx)?;

        // 2. Build the trees and the block.
        let operations_tree = executor.operations_tree()?;
        let (states_tree, states) = executor.states_tree()?;
        operations.extend(executor.added_operations());
        pool.done();

        let manifest = Manifest::new(
            height,
            self.proposal.round(),
            self.proposal.hash().clone(),
            previous_block,
            operations_tree
                .root()
                .map(|root| ValueHash::from_sha256_bytes(root.to_vec())),
            states_tree
                .root()
                .map(|root| ValueHash::from_sha256_bytes(root.to_vec())),
            *self.init_voteproof.finished_at(),
        );

        let block = Block {
            manifest,
            consensus_info: ConsensusInfo {
                init_voteproof: self.init_voteproof.clone(),
                accept_voteproof: None,
                suffrage_info: SuffrageInfo::new(
                    self.proposal.fact().proposer().clone(),
                    self.config.suffrage_nodes.clone(),
                ),
                proposal: self.proposal.clone(),
            },
            operations,
            operations_tree,
            states,
            states_tree,
        };
        block
            .is_valid()
            .map_err(|err| ProcessError::failed(format!("invalid block; {}", err)))?;
        self.check(ctx)?;

        // 3. Write the block data known so far.
        let session = Arc::new(self.block_data.new_session(height)?);
        self.work().session = Some(Arc::clone(&session));
        self.check(ctx)?;

        session.set_manifest(&block.manifest)?;
        session.set_operations(&block.operations)?;
        session.set_operations_tree(&block.operations_tree)?;
        session.set_states(&block.states)?;
        session.set_states_tree(&block.states_tree)?;
        session.set_init_voteproof(&block.consensus_info.init_voteproof)?;
        session.set_suffrage_info(&block.consensus_info.suffrage_info)?;
        session.set_proposal(&block.consensus_info.proposal)?;

        Ok(block)
    }

    fn commit(&self, ctx: &Context) -> Result<(), ProcessError> {
        self.check(ctx)?;

        let (accept_voteproof, block, session, map) = {
            let work = self.work();
            (
                work.accept_voteproof.clone(),
                work.block.clone(),
                work.session.clone(),
                work.map.clone(),
            )
        };
        let accept_voteproof = accept_voteproof.ok_or_else(|| ProcessError::failed("empty accept voteproof"))?;
        let mut block = block.ok_or_else(|| ProcessError::failed("empty block"))?;
        block.consensus_info.accept_voteproof = Some(accept_voteproof.clone());
        block
            .is_valid()
            .map_err(|err| ProcessError::failed(format!("invalid block; {}", err)))?;

        // A retry after a failed commit finds the block data already in place.
        let map = match map {
            Some(map) => map,
            None => {
                let session = match session {
                    Some(session) => session,
                    None => {
                        let session = Arc::new(self.block_data.new_session(block.height())?);
                        self.work().session = Some(Arc::clone(&session));
                        session.set_block(&block)?;
                        session
                    }
                };

                let map = match self.save_block_data(ctx, &session, &accept_voteproof) {
                    Ok(map) => map,
                    Err(err) => {
                        // Files may have moved already; the next attempt writes a new session.
                        self.work().session = None;
                        if let Err(cancel_err) = session.cancel() {
                            log::error!("failed to drop block data session; {}", cancel_err);
                        }
                        return Err(err);
                    }
                };
                let mut work = self.work();
                work.map = Some(map.clone());
                work.session = None;
                map
            }
        };

        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        // Cancel must not slip in between the commit and the Saved state.
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == ProcessorState::Canceled {
            return Err(ProcessError::failed("canceled"));
        }
        self.database.commit(&block, &map)?;
        info::commit_block(&block);
        self.work().block = Some(block);
        *state = ProcessorState::Saved;

        Ok(())
    }

    fn save_block_data(
        &self,
        ctx: &Context,
        session: &Session,
        accept_voteproof: &Voteproof,
    ) -> Result<BlockDataMap, ProcessError> {
        session.set_accept_voteproof(accept_voteproof)?;
        self.check(ctx)?;
        Ok(self.block_data.save_session(session)?)
    }

    /// Drop the operation executor and the open session.
    fn discard(&self) -> Result<(), ProcessError> {
        let (executor, session) = {
            let mut work = self.work();
            (work.operations.take(), work.session.take())
        };
        if let Some(executor) = executor {
            executor.cancel()?;
        }
        if let Some(session) = session {
            session.cancel()?;
        }
        Ok(())
    }
}

impl Processor for DefaultProcessor {
    fn state(&self) -> ProcessorState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    fn prepare(&self, ctx: &Context) -> Result<Option<Block>, ProcessError> {
        match self.state() {
            ProcessorState::BeforePrepared | ProcessorState::PrepareFailed => (),
            ProcessorState::Canceled => return Err(ProcessError::failed("canceled")),
            state => return Err(ProcessError::failed(format!("can not prepare in {} state", state))),
        }
        self.set_state(ProcessorState::Preparing)?;

        match self.build_block(ctx) {
            Ok(block) => {
                self.work().operations = None;
                self.work().block = Some(block.clone());
                self.set_state(ProcessorState::Prepared)?;
                Ok(Some(block))
            }
            Err(err) => {
                if let Err(discard_err) = self.discard() {
                    log::error!("failed to clean up failed prepare; {}", discard_err);
                }
                // A canceled processor stays canceled.
                let _ = self.set_state(ProcessorState::PrepareFailed);
                Err(err)
            }
        }
    }

    fn set_accept_voteproof(&self, voteproof: Voteproof) -> Result<(), ProcessError> {
        if voteproof.stage() != Stage::Accept {
            return Err(ProcessError::InvalidVoteproof(voteproof.stage()));
        }
        if voteproof.height() != self.proposal.height() || voteproof.round() != self.proposal.round() {
            return Err(ProcessError::failed(format!(
                "accept voteproof does not match proposal; voteproof={}/{} proposal={}/{}",
                voteproof.height(),
                voteproof.round(),
                self.proposal.height(),
                self.proposal.round()
            )));
        }

        self.work().accept_voteproof = Some(voteproof);
        Ok(())
    }

    fn save(&self, ctx: &Context) -> Result<(), ProcessError> {
        match self.state() {
            ProcessorState::Prepared | ProcessorState::SaveFailed => (),
            ProcessorState::Canceled => return Err(ProcessError::failed("canceled")),
            state => return Err(ProcessError::failed(format!("can not save in {} state", state))),
        }
        self.set_state(ProcessorState::Saving)?;

        match self.commit(ctx) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.set_state(ProcessorState::SaveFailed);
                Err(err)
            }
        }
    }

    /// Cancel the processor. A `Saved` or already `Canceled` processor is left as it is.
    fn cancel(&self) -> Result<(), ProcessError> {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, ProcessorState::Saved | ProcessorState::Canceled) {
                return Ok(());
            }
            *state = ProcessorState::Canceled;
        }
        self.discard()
    }

    fn block(&self) -> Option<Block> {
        self.work().block.clone()
    }
}
