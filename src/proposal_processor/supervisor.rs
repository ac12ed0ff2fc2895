/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Supervisor`] keeps at most one live [`Processor`] and serializes every decision about it.
//!
//! ## Request loop
//!
//! [`new_proposal`](Supervisor::new_proposal) and [`save`](Supervisor::save) only enqueue a request and
//! hand back a receiver that gets exactly one [`ProcessResult`]. A single thread takes requests off the
//! queue and decides, for each of them, which processor to act on:
//!
//! | current                      | same proposal | action                                          |
//! |------------------------------|---------------|-------------------------------------------------|
//! | none                         |               | create a processor and prepare it               |
//! | Preparing, Prepared, Saving, Saved, Canceled | yes | ignore (`already <state>`)             |
//! | PrepareFailed, SaveFailed    | yes           | create a new processor and prepare it           |
//! | Saved                        | no            | ignore (`duplicated proposal received`)         |
//! | any other                    | no            | cancel the current one, create and prepare      |
//!
//! Prepare and save run on their own threads under a child [`Context`] of the caller's, so that the loop
//! stays free to cancel them. Only the loop thread writes the current processor; everyone else reads a
//! snapshot through [`current`](Supervisor::current).
//!
//! ## Retries
//!
//! Both phases are retried every [`retry_interval`](SupervisorConfiguration::retry_interval) until they
//! succeed, the context is done, the processor is canceled, or the error is a context error. Save also
//! gives up on ignored errors and when the processor falls below `Prepared`. A save that arrives while
//! the processor is still preparing waits for prepare to finish.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SendError, Sender, SyncSender, TryRecvError},
        Arc, Mutex, PoisonError, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    context::{CancelHandle, Context},
    logging::{self, debug, info},
    retry::{retry, RetryError},
    types::{basic::Stage, crypto_primitives::ValueHash, proposal::Proposal, voteproof::Voteproof},
};

use super::{ProcessError, ProcessResult, Processor, ProcessorState};

/// Creates the processor for a proposal and its INIT voteproof.
pub type ProcessorNewFn =
    Box<dyn Fn(&Proposal, &Voteproof) -> Result<Arc<dyn Processor>, ProcessError> + Send>;

/// Checks a proposal before any processor is created for it.
pub type ProposalChecker = Box<dyn Fn(&Proposal) -> Result<(), ProcessError> + Send>;

type CurrentProcessor = Arc<RwLock<Option<Arc<dyn Processor>>>>;

/// Timing parameters of the [`Supervisor`].
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [SupervisorConfiguration]. Every field has a default, so
    `SupervisorConfiguration::builder().build()` is a valid configuration.

    Optional:
    - `.retry_interval(...)`
    - `.retry_limit(...)`
    - `.preparing_poll_interval(...)`
    - `.loop_poll_interval(...)`
"))]
pub struct SupervisorConfiguration {
    #[builder(
        default = Duration::from_millis(200),
        setter(doc = "Set the pause between two prepare or save attempts. Defaults to 200 ms.")
    )]
    pub retry_interval: Duration,
    #[builder(
        default,
        setter(strip_option, doc = "Set the maximum number of prepare or save attempts. Unbounded by default.")
    )]
    pub retry_limit: Option<u32>,
    #[builder(
        default = Duration::from_millis(300),
        setter(doc = "Set how often a save waiting for prepare checks the processor state. Defaults to 300 ms.")
    )]
    pub preparing_poll_interval: Duration,
    #[builder(
        default = Duration::from_millis(10),
        setter(doc = "Set how long the request loop waits for a request before checking for shutdown. Defaults to 10 ms.")
    )]
    pub loop_poll_interval: Duration,
}

impl Default for SupervisorConfiguration {
    fn default() -> Self {
        Self::builder().build()
    }
}

enum Request {
    Proposal {
        ctx: Context,
        proposal: Proposal,
        voteproof: Voteproof,
        result: SyncSender<ProcessResult>,
    },
    Save {
        ctx: Context,
        proposal: ValueHash,
        voteproof: Voteproof,
        result: SyncSender<ProcessResult>,
    },
}

impl Request {
    fn reply(self, result: ProcessResult) {
        let (Request::Proposal { result: sender, .. } | Request::Save { result: sender, .. }) = self;
        reply(&sender, result);
    }
}

pub struct Supervisor {
    current: CurrentProcessor,
    requests: Mutex<Sender<Request>>,
    idle: Option<SupervisorLoop>,
    running: Option<(Sender<()>, JoinHandle<SupervisorLoop>)>,
}

impl Supervisor {
    /// Create a stopped supervisor. Requests are queued until [`start`](Self::start) is called.
    pub fn new(
        config: SupervisorConfiguration,
        new_processor: impl Fn(&Proposal, &Voteproof) -> Result<Arc<dyn Processor>, ProcessError> + Send + 'static,
        proposal_checker: Option<ProposalChecker>,
    ) -> Self {
        let current: CurrentProcessor = Arc::new(RwLock::new(None));
        let (requests, receiver) = mpsc::channel();

        Self {
            current: Arc::clone(&current),
            requests: Mutex::new(requests),
            idle: Some(SupervisorLoop {
                config,
                current,
                requests: receiver,
                new_processor: Box::new(new_processor),
                proposal_checker,
                cancel_prepare: None,
                cancel_save: None,
            }),
            running: None,
        }
    }

    /// Start the request loop thread. Does nothing if it is already running.
    pub fn start(&mut self) {
        if let Some(supervisor_loop) = self.idle.take() {
            let (shutdown, shutdown_signal) = mpsc::channel();
            let handle = thread::spawn(move || supervisor_loop.run(shutdown_signal));
            self.running = Some((shutdown, handle));
        }
    }

    /// Stop the request loop and cancel in-flight prepare and save work.
    pub fn stop(&mut self) {
        if let Some((shutdown, handle)) = self.running.take() {
            let _ = shutdown.send(());
            match handle.join() {
                Ok(supervisor_loop) => self.idle = Some(supervisor_loop),
                Err(_) => log::error!("proposal supervisor thread panicked"),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Process `proposal`, justified by `init_voteproof`. The returned receiver gets exactly one result:
    /// the prepared block, or why there is none.
    pub fn new_proposal(&self, ctx: &Context, proposal: Proposal, init_voteproof: Voteproof) -> Receiver<ProcessResult> {
        let (sender, receiver) = mpsc::sync_channel(1);
        if init_voteproof.stage() != Stage::Init {
            reply(&sender, ProcessResult::err(ProcessError::InvalidVoteproof(init_voteproof.stage())));
            return receiver;
        }

        self.send(Request::Proposal {
            ctx: ctx.clone(),
            proposal,
            voteproof: init_voteproof,
            result: sender,
        });
        receiver
    }

    /// Save the block prepared for the proposal `proposal_hash`, sealed by `accept_voteproof`.
    pub fn save(&self, ctx: &Context, proposal_hash: ValueHash, accept_voteproof: Voteproof) -> Receiver<ProcessResult> {
        let (sender, receiver) = mpsc::sync_channel(1);
        if accept_voteproof.stage() != Stage::Accept {
            reply(&sender, ProcessResult::err(ProcessError::InvalidVoteproof(accept_voteproof.stage())));
            return receiver;
        }

        self.send(Request::Save {
            ctx: ctx.clone(),
            proposal: proposal_hash,
            voteproof: accept_voteproof,
            result: sender,
        });
        receiver
    }

    fn send(&self, request: Request) {
        let sent = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(request);
        if let Err(SendError(request)) = sent {
            request.reply(ProcessResult::err(ProcessError::failed("proposal supervisor is gone")));
        }
    }

    /// Snapshot of the current processor.
    pub fn current(&self) -> Option<Arc<dyn Processor>> {
        read_current(&self.current)
    }

    /// State of the current processor if it processes `proposal_hash`.
    pub fn current_state(&self, proposal_hash: &ValueHash) -> Option<ProcessorState> {
        self.current()
            .filter(|current| current.proposal().hash() == proposal_hash)
            .map(|current| current.state())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop()
    }
}

/// Everything owned by the request loop thread.
struct SupervisorLoop {
    config: SupervisorConfiguration,
    current: CurrentProcessor,
    requests: Receiver<Request>,
    new_processor: ProcessorNewFn,
    proposal_checker: Option<ProposalChecker>,
    cancel_prepare: Option<CancelHandle>,
    cancel_save: Option<CancelHandle>,
}

impl SupervisorLoop {
    fn run(mut self, shutdown_signal: Receiver<()>) -> SupervisorLoop {
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => (),
            }

            match self.requests.recv_timeout(self.config.loop_poll_interval) {
                Ok(Request::Proposal {
                    ctx,
                    proposal,
                    voteproof,
                    result,
                }) => self.handle_proposal(&ctx, proposal, voteproof, result),
                Ok(Request::Save {
                    ctx,
                    proposal,
                    voteproof,
                    result,
                }) => self.handle_save(&ctx, proposal, voteproof, result),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.cancel_in_flight();
        self
    }

    fn handle_proposal(
        &mut self,
        ctx: &Context,
        proposal: Proposal,
        voteproof: Voteproof,
        result: SyncSender<ProcessResult>,
    ) {
        let processor = match self.processor_for(&proposal, &voteproof) {
            Ok(processor) => processor,
            Err(err) => {
                logging::request_failed("proposal", proposal.hash(), &err);
                reply(&result, ProcessResult::err(err));
                return;
            }
        };

        let (ctx, cancel) = ctx.with_cancel();
        self.cancel_prepare = Some(cancel);

        let config = self.config.clone();
        thread::spawn(move || reply(&result, prepare(&ctx, &config, processor.as_ref())));
    }

    /// Run the proposal through the decision table and return the processor to prepare.
    fn processor_for(&mut self, proposal: &Proposal, voteproof: &Voteproof) -> Result<Arc<dyn Processor>, ProcessError> {
        self.check_proposal(proposal)
            .map_err(|err| ProcessError::PrepareFailed(Box::new(err)))?;

        if let Some(current) = read_current(&self.current) {
            if current.proposal().hash() != proposal.hash() {
                if current.state() == ProcessorState::Saved {
                    return Err(ProcessError::ignored("duplicated proposal received"));
                }

                self.cancel_processor(current.as_ref())
                    .map_err(|err| ProcessError::PrepareFailed(Box::new(err)))?;
                // The save may have finished while cancelling.
                if current.state() == ProcessorState::Saved {
                    return Err(ProcessError::ignored("duplicated proposal received"));
                }
            } else {
                match current.state() {
                    ProcessorState::BeforePrepared => return Ok(current),
                    ProcessorState::PrepareFailed | ProcessorState::SaveFailed => (),
                    ProcessorState::Preparing => return Err(ProcessError::ignored("already preparing")),
                    ProcessorState::Prepared => return Err(ProcessError::ignored("already prepared")),
                    ProcessorState::Saving => return Err(ProcessError::ignored("already saving")),
                    ProcessorState::Saved => return Err(ProcessError::ignored("already saved")),
                    ProcessorState::Canceled => return Err(ProcessError::ignored("already canceled")),
                }
            }
        }

        let processor = (self.new_processor)(proposal, voteproof)
            .map_err(|err| ProcessError::PrepareFailed(Box::new(err)))?;
        let state = processor.state();
        if state != ProcessorState::BeforePrepared {
            return Err(ProcessError::PrepareFailed(Box::new(ProcessError::failed(format!(
                "new processor should be in BeforePrepared state, not {}",
                state
            )))));
        }

        info::new_processor(proposal);
        self.set_current(Some(Arc::clone(&processor)));

        Ok(processor)
    }

    fn check_proposal(&self, proposal: &Proposal) -> Result<(), ProcessError> {
        proposal
            .is_valid()
            .map_err(|err| ProcessError::failed(format!("invalid proposal; {}", err)))?;

        match &self.proposal_checker {
            Some(checker) => checker(proposal),
            None => Ok(()),
        }
    }

    fn handle_save(
        &mut self,
        ctx: &Context,
        proposal: ValueHash,
        voteproof: Voteproof,
        result: SyncSender<ProcessResult>,
    ) {
        let processor = match read_current(&self.current) {
            None => Err(ProcessError::failed("not yet prepared")),
            Some(current) if current.proposal().hash() != &proposal => Err(ProcessError::failed(
                "not yet prepared; another processor already exists",
            )),
            Some(current) => Ok(current),
        };
        let processor = match processor {
            Ok(processor) => processor,
            Err(err) => {
                let err = ProcessError::SaveFailed(Box::new(err));
                logging::request_failed("save", &proposal, &err);
                reply(&result, ProcessResult::err(err));
                return;
            }
        };

        let (ctx, cancel) = ctx.with_cancel();
        self.cancel_save = Some(cancel);

        let config = self.config.clone();
        thread::spawn(move || reply(&result, save(&ctx, &config, processor.as_ref(), voteproof)));
    }

    /// Stop whatever runs for the current processor, then cancel the processor itself.
    fn cancel_processor(&mut self, processor: &dyn Processor) -> Result<(), ProcessError> {
        self.cancel_in_flight();

        info::cancel_processor(processor.proposal(), processor.state());
        processor.cancel()
    }

    fn cancel_in_flight(&mut self) {
        if let Some(cancel) = self.cancel_prepare.take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.cancel_save.take() {
            cancel.cancel();
        }
    }

    fn set_current(&self, processor: Option<Arc<dyn Processor>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = processor;
    }
}

fn prepare(ctx: &Context, config: &SupervisorConfiguration, processor: &dyn Processor) -> ProcessResult {
    let hash = processor.proposal().hash().clone();

    let prepared = retry(ctx, config.retry_limit, config.retry_interval, |attempt| {
        if let Some(err) = ctx.err() {
            return Err(ProcessError::from(err).stop_retrying());
        }

        match processor.prepare(ctx) {
            Ok(block) => Ok(block),
            Err(err) if err.is_context() => Err(err.stop_retrying()),
            Err(_) if processor.state() == ProcessorState::Canceled => {
                Err(ProcessError::failed("canceled").stop_retrying())
            }
            Err(err) => {
                debug::retry("prepare", &hash, attempt, &err);
                Err(err)
            }
        }
    });

    match prepared {
        Ok(block) => {
            info::prepare_block(processor.proposal(), block.as_ref());
            ProcessResult::ok(block)
        }
        Err(err) => {
            let err = ProcessError::PrepareFailed(Box::new(err));
            logging::request_failed("prepare", &hash, &err);
            cancel_if_in_progress(processor);

            ProcessResult::err(err)
        }
    }
}

fn save(ctx: &Context, config: &SupervisorConfiguration, processor: &dyn Processor, voteproof: Voteproof) -> ProcessResult {
    let hash = processor.proposal().hash().clone();

    let saved = retry(ctx, config.retry_limit, config.retry_interval, |attempt| {
        if let Some(err) = ctx.err() {
            return Err(ProcessError::from(err).stop_retrying());
        }

        match save_once(ctx, config, processor, &voteproof) {
            Ok(()) => Ok(()),
            Err(err) if err.is_context() || err.is_ignored() => Err(err.stop_retrying()),
            Err(_) if processor.state() == ProcessorState::Canceled => {
                Err(ProcessError::failed("canceled").stop_retrying())
            }
            Err(err) if processor.state() < ProcessorState::Prepared => Err(err.stop_retrying()),
            Err(err) => {
                debug::retry("save", &hash, attempt, &err);
                Err(err)
            }
        }
    });

    match saved {
        Ok(()) => {
            let block = processor.block();
            info::save_block(processor.proposal(), block.as_ref());
            ProcessResult::ok(block)
        }
        Err(err) => {
            let err = ProcessError::SaveFailed(Box::new(err));
            logging::request_failed("save", &hash, &err);
            cancel_if_in_progress(processor);

            ProcessResult::err(err)
        }
    }
}

/// Check that `processor` may be saved, waiting for a running prepare to finish, then save it.
fn save_once(
    ctx: &Context,
    config: &SupervisorConfiguration,
    processor: &dyn Processor,
    voteproof: &Voteproof,
) -> Result<(), ProcessError> {
    loop {
        match processor.state() {
            ProcessorState::BeforePrepared => return Err(ProcessError::failed("not yet prepared")),
            ProcessorState::Preparing => {
                debug::wait_preparing(processor.proposal().hash());
                ctx.sleep(config.preparing_poll_interval)?;
            }
            ProcessorState::Prepared | ProcessorState::SaveFailed => break,
            ProcessorState::PrepareFailed => return Err(ProcessError::failed("failed to prepare")),
            ProcessorState::Saving => return Err(ProcessError::ignored("already saving")),
            ProcessorState::Saved => return Err(ProcessError::ignored("already saved")),
            ProcessorState::Canceled => return Err(ProcessError::ignored("canceled")),
        }
    }

    processor.set_accept_voteproof(voteproof.clone())?;
    processor.save(ctx)
}

fn cancel_if_in_progress(processor: &dyn Processor) {
    if matches!(processor.state(), ProcessorState::Preparing | ProcessorState::Saving) {
        if let Err(err) = processor.cancel() {
            log::error!("failed to cancel processor; {}", err);
        }
    }
}

fn read_current(current: &CurrentProcessor) -> Option<Arc<dyn Processor>> {
    current.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn reply(sender: &SyncSender<ProcessResult>, result: ProcessResult) {
    // The caller may have stopped waiting.
    let _ = sender.try_send(result);
}
