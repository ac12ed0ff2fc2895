//! A [`Processor`] whose prepare and save are closures supplied by the test.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use blockproc_rs::{
    context::Context,
    proposal_processor::{ProcessError, Processor, ProcessorState},
    types::{block::Block, proposal::Proposal, voteproof::Voteproof},
};

type PrepareFn = dyn Fn(&Context, &Proposal, &Voteproof) -> Result<Option<Block>, ProcessError> + Send + Sync;
type SaveFn = dyn Fn(&Context) -> Result<(), ProcessError> + Send + Sync;

pub(crate) struct DummyProcessor {
    proposal: Proposal,
    init_voteproof: Voteproof,
    state: RwLock<ProcessorState>,
    block: Mutex<Option<Block>>,
    accept_voteproof: Mutex<Option<Voteproof>>,
    prepare_fn: Option<Arc<PrepareFn>>,
    save_fn: Option<Arc<SaveFn>>,
    prepare_calls: AtomicU32,
    save_calls: AtomicU32,
}

impl DummyProcessor {
    pub(crate) fn prepare_calls(&self) -> u32 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn save_calls(&self) -> u32 {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn accept_voteproof(&self) -> Option<Voteproof> {
        self.accept_voteproof.lock().unwrap().clone()
    }

    /// Force the processor into `state`, bypassing the lifecycle.
    pub(crate) fn force_state(&self, state: ProcessorState) {
        *self.state.write().unwrap() = state;
    }

    fn set_state(&self, state: ProcessorState) -> bool {
        let mut current = self.state.write().unwrap();
        if *current == ProcessorState::Canceled {
            return false;
        }
        *current = state;
        true
    }
}

impl Processor for DummyProcessor {
    fn state(&self) -> ProcessorState {
        *self.state.read().unwrap()
    }

    fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    fn prepare(&self, ctx: &Context) -> Result<Option<Block>, ProcessError> {
        match self.state() {
            ProcessorState::BeforePrepared | ProcessorState::PrepareFailed => (),
            state => return Err(ProcessError::failed(format!("can not prepare in {} state", state))),
        }
        if !self.set_state(ProcessorState::Preparing) {
            return Err(ProcessError::failed("canceled"));
        }
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);

        let prepared = match &self.prepare_fn {
            Some(prepare_fn) => prepare_fn(ctx, &self.proposal, &self.init_voteproof),
            None => Ok(None),
        };

        match prepared {
            Ok(block) => {
                *self.block.lock().unwrap() = block.clone();
                if !self.set_state(ProcessorState::Prepared) {
                    return Err(ProcessError::failed("canceled"));
                }
                Ok(block)
            }
            Err(err) => {
                self.set_state(ProcessorState::PrepareFailed);
                Err(err)
            }
        }
    }

    fn set_accept_voteproof(&self, voteproof: Voteproof) -> Result<(), ProcessError> {
        *self.accept_voteproof.lock().unwrap() = Some(voteproof);
        Ok(())
    }

    fn save(&self, ctx: &Context) -> Result<(), ProcessError> {
        match self.state() {
            ProcessorState::Prepared | ProcessorState::SaveFailed => (),
            state => return Err(ProcessError::failed(format!("can not save in {} state", state))),
        }
        if !self.set_state(ProcessorState::Saving) {
            return Err(ProcessError::failed("canceled"));
        }
        self.save_calls.fetch_add(1, Ordering::SeqCst);

        let saved = match &self.save_fn {
            Some(save_fn) => save_fn(ctx),
            None => Err(ProcessError::failed("empty save func")),
        };

        match saved {
            Ok(()) => {
                if !self.set_state(ProcessorState::Saved) {
                    return Err(ProcessError::failed("canceled"));
                }
                Ok(())
            }
            Err(err) => {
                self.set_state(ProcessorState::SaveFailed);
                Err(err)
            }
        }
    }

    fn cancel(&self) -> Result<(), ProcessError> {
        let mut state = self.state.write().unwrap();
        if *state != ProcessorState::Saved {
            *state = ProcessorState::Canceled;
        }
        Ok(())
    }

    fn block(&self) -> Option<Block> {
        self.block.lock().unwrap().clone()
    }
}

/// Creates [`DummyProcessor`]s for the supervisor and remembers every one it created.
#[derive(Clone, Default)]
pub(crate) struct DummyProcessorFactory {
    prepare_fn: Option<Arc<PrepareFn>>,
    save_fn: Option<Arc<SaveFn>>,
    created: Arc<Mutex<Vec<Arc<DummyProcessor>>>>,
}

impl DummyProcessorFactory {
    pub(crate) fn new() -> DummyProcessorFactory {
        DummyProcessorFactory::default()
    }

    pub(crate) fn with_prepare(
        mut self,
        prepare_fn: impl Fn(&Context, &Proposal, &Voteproof) -> Result<Option<Block>, ProcessError> + Send + Sync + 'static,
    ) -> DummyProcessorFactory {
        let prepare_fn: Arc<PrepareFn> = Arc::new(prepare_fn);
        self.prepare_fn = Some(prepare_fn);
        self
    }

    pub(crate) fn with_save(
        mut self,
        save_fn: impl Fn(&Context) -> Result<(), ProcessError> + Send + Sync + 'static,
    ) -> DummyProcessorFactory {
        let save_fn: Arc<SaveFn> = Arc::new(save_fn);
        self.save_fn = Some(save_fn);
        self
    }

    pub(crate) fn new_fn(
        &self,
    ) -> impl Fn(&Proposal, &Voteproof) -> Result<Arc<dyn Processor>, ProcessError> + Send + 'static {
        let factory = self.clone();
        move |proposal, init_voteproof| {
            let processor = Arc::new(DummyProcessor {
                proposal: proposal.clone(),
                init_voteproof: init_voteproof.clone(),
                state: RwLock::new(ProcessorState::BeforePrepared),
                block: Mutex::new(None),
                accept_voteproof: Mutex::new(None),
                prepare_fn: factory.prepare_fn.clone(),
                save_fn: factory.save_fn.clone(),
                prepare_calls: AtomicU32::new(0),
                save_calls: AtomicU32::new(0),
            });
            factory.created.lock().unwrap().push(Arc::clone(&processor));
            Ok(processor as Arc<dyn Processor>)
        }
    }

    /// Every processor created so far, oldest first.
    pub(crate) fn created(&self) -> Vec<Arc<DummyProcessor>> {
        self.created.lock().unwrap().clone()
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
