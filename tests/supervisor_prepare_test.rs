//! Tests for how the proposal supervisor handles new proposals.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use blockproc_rs::{
    context::Context,
    proposal_processor::{
        ProcessError, Processor, ProcessorState, Supervisor, SupervisorConfiguration,
    },
    types::proposal::Proposal,
};
use log::LevelFilter;

mod common;

use crate::common::{
    dummy_processor::{wait_until, DummyProcessorFactory},
    fixtures::{accept_voteproof, empty_block, init_voteproof, proposal},
    logging::setup_logger,
};

const RESULT_TIMEOUT: Duration = Duration::from_secs(3);

fn start_supervisor(factory: &DummyProcessorFactory, config: SupervisorConfiguration) -> Supervisor {
    let mut supervisor = Supervisor::new(config, factory.new_fn(), None);
    supervisor.start();
    supervisor
}

fn fast_config() -> SupervisorConfiguration {
    SupervisorConfiguration::builder()
        .retry_interval(Duration::from_millis(20))
        .preparing_poll_interval(Duration::from_millis(20))
        .build()
}

#[test]
fn prepare_returns_block_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Start a supervisor whose processors prepare an empty block.
    let factory = DummyProcessorFactory::new()
        .with_prepare(|_, proposal, init_voteproof| Ok(Some(empty_block(proposal, init_voteproof))));
    let supervisor = start_supervisor(&factory, fast_config());

    // 2. Submit a proposal at height 33, round 33.
    log::debug!("Submitting a proposal at height 33, round 33.");
    let proposal = proposal(33, 33, Vec::new());
    let result = supervisor
        .new_proposal(&Context::background(), proposal.clone(), init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();

    // 3. Check the block and the state of the current processor.
    log::debug!("Checking the prepared block.");
    assert!(result.err.is_none(), "unexpected error: {:?}", result.err);
    let block = result.block.unwrap();
    assert_eq!(block.manifest.proposal(), proposal.hash());
    assert_eq!(block.height().int(), 33);

    let current = supervisor.current().unwrap();
    assert_eq!(current.proposal().hash(), proposal.hash());
    assert_eq!(current.state(), ProcessorState::Prepared);
    assert_eq!(supervisor.current_state(proposal.hash()), Some(ProcessorState::Prepared));
}

#[test]
fn wrong_stage_init_voteproof_test() {
    setup_logger(LevelFilter::Trace);

    let factory = DummyProcessorFactory::new();
    let supervisor = start_supervisor(&factory, fast_config());

    log::debug!("Submitting a proposal with an ACCEPT voteproof.");
    let result = supervisor
        .new_proposal(&Context::background(), proposal(33, 33, Vec::new()), accept_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();

    assert!(result.block.is_none());
    let err = result.err.unwrap();
    assert!(err.to_string().contains("not valid voteproof"), "{}", err);
    assert!(supervisor.current().is_none());
    assert!(factory.created().is_empty());
}

#[test]
fn duplicated_proposal_after_save_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Prepare and save a first proposal.
    let factory = DummyProcessorFactory::new().with_save(|_| Ok(()));
    let supervisor = start_supervisor(&factory, fast_config());

    let ctx = Context::background();
    let first = proposal(33, 33, Vec::new());

    log::debug!("Preparing and saving the first proposal.");
    let result = supervisor
        .new_proposal(&ctx, first.clone(), init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();
    assert!(result.err.is_none());
    let result = supervisor
        .save(&ctx, first.hash().clone(), accept_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();
    assert!(result.err.is_none(), "unexpected error: {:?}", result.err);
    assert_eq!(supervisor.current_state(first.hash()), Some(ProcessorState::Saved));

    // 2. A different proposal is ignored while the saved processor is current.
    log::debug!("Submitting a different proposal after the first one was saved.");
    let second = proposal(34, 0, Vec::new());
    let result = supervisor
        .new_proposal(&ctx, second, init_voteproof(34, 0))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();

    let err = result.err.unwrap();
    assert!(err.is_ignored());
    assert!(err.to_string().contains("duplicated proposal received"), "{}", err);
    assert_eq!(supervisor.current().unwrap().proposal().hash(), first.hash());
    assert_eq!(factory.created().len(), 1);

    // 3. The same proposal is ignored as already saved.
    log::debug!("Submitting the saved proposal again.");
    let result = supervisor
        .new_proposal(&ctx, first, init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();
    let err = result.err.unwrap();
    assert!(err.is_ignored());
    assert!(err.to_string().contains("already saved"), "{}", err);
}

#[test]
fn supersede_in_flight_proposals_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Start a supervisor whose processors take one second to prepare.
    let factory = DummyProcessorFactory::new().with_prepare(|ctx, proposal, init_voteproof| {
        ctx.sleep(Duration::from_secs(1))?;
        Ok(Some(empty_block(proposal, init_voteproof)))
    });
    let supervisor = start_supervisor(&factory, fast_config());
    let ctx = Context::background();

    // 2. Submit a proposal at height 33, then five more at heights 34 to 38 right after.
    log::debug!("Submitting six proposals in quick succession.");
    let mut receivers = vec![supervisor.new_proposal(&ctx, proposal(33, 33, Vec::new()), init_voteproof(33, 33))];
    thread::sleep(Duration::from_millis(10));
    let mut last = None;
    for height in 34..39 {
        let next = proposal(height, 3, Vec::new());
        last = Some(next.clone());
        receivers.push(supervisor.new_proposal(&ctx, next, init_voteproof(height, 3)));
    }
    let last = last.unwrap();

    // 3. Only the last proposal gets a block; every earlier one is canceled.
    log::debug!("Waiting for the last proposal to be prepared.");
    let results: Vec<_> = receivers
        .into_iter()
        .map(|receiver| receiver.recv_timeout(RESULT_TIMEOUT).unwrap())
        .collect();

    let (last_result, earlier_results) = results.split_last().unwrap();
    assert!(last_result.err.is_none(), "unexpected error: {:?}", last_result.err);
    assert_eq!(last_result.block.as_ref().unwrap().manifest.proposal(), last.hash());
    for result in earlier_results {
        assert!(result.block.is_none());
        assert!(result.err.is_some());
    }

    let created = factory.created();
    assert_eq!(created.len(), 6);
    for processor in &created[..5] {
        assert_eq!(processor.state(), ProcessorState::Canceled);
    }
    assert_eq!(created[5].state(), ProcessorState::Prepared);
    assert_eq!(supervisor.current().unwrap().proposal().hash(), last.hash());
}

#[test]
fn prepare_timeout_test() {
    setup_logger(LevelFilter::Trace);

    let factory = DummyProcessorFactory::new().with_prepare(|ctx, _, _| {
        ctx.sleep(Duration::from_secs(3600))?;
        Ok(None)
    });
    let supervisor = start_supervisor(&factory, fast_config());

    log::debug!("Submitting a proposal that never finishes preparing, with a 300 ms deadline.");
    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(300));
    let result = supervisor
        .new_proposal(&ctx, proposal(33, 33, Vec::new()), init_voteproof(33, 33))
        .recv_timeout(Duration::from_millis(1300))
        .unwrap();

    assert!(result.block.is_none());
    let err = result.err.unwrap();
    assert!(err.is_prepare_failed());
    assert!(err.to_string().contains("context deadline exceeded"), "{}", err);
}

#[test]
fn prepare_retry_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Processors fail to prepare twice before succeeding.
    let attempts = Arc::new(AtomicU32::new(0));
    let factory = DummyProcessorFactory::new().with_prepare({
        let attempts = Arc::clone(&attempts);
        move |_, proposal, init_voteproof| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(ProcessError::failed("findme"));
            }
            Ok(Some(empty_block(proposal, init_voteproof)))
        }
    });
    let supervisor = start_supervisor(&factory, fast_config());

    // 2. The supervisor retries until the block is prepared.
    log::debug!("Submitting a proposal whose first two prepare attempts fail.");
    let result = supervisor
        .new_proposal(&Context::background(), proposal(33, 33, Vec::new()), init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();

    assert!(result.err.is_none(), "unexpected error: {:?}", result.err);
    assert!(result.block.is_some());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(factory.created().len(), 1);
    assert_eq!(factory.created()[0].prepare_calls(), 3);
}

#[test]
fn prepare_failed_proposal_is_rebuilt_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Prepare fails on every attempt and the supervisor gives up after two.
    let factory = DummyProcessorFactory::new().with_prepare(|_, _, _| Err(ProcessError::failed("findme")));
    let config = SupervisorConfiguration::builder()
        .retry_interval(Duration::from_millis(20))
        .retry_limit(2)
        .build();
    let supervisor = start_supervisor(&factory, config);
    let ctx = Context::background();
    let proposal = proposal(33, 33, Vec::new());

    log::debug!("Submitting a proposal that can not be prepared.");
    let result = supervisor
        .new_proposal(&ctx, proposal.clone(), init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();
    let err = result.err.unwrap();
    assert!(err.is_prepare_failed());
    assert!(err.to_string().contains("findme"), "{}", err);
    assert_eq!(factory.created()[0].prepare_calls(), 2);

    // 2. The failed processor stays current.
    assert_eq!(supervisor.current_state(proposal.hash()), Some(ProcessorState::PrepareFailed));

    // 3. The same proposal again gets a fresh processor.
    log::debug!("Submitting the same proposal again.");
    let result = supervisor
        .new_proposal(&ctx, proposal.clone(), init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();
    assert!(result.err.unwrap().is_prepare_failed());
    assert_eq!(factory.created().len(), 2);
}

#[test]
fn same_proposal_while_preparing_is_ignored_test() {
    setup_logger(LevelFilter::Trace);

    let factory = DummyProcessorFactory::new().with_prepare(|ctx, _, _| {
        ctx.sleep(Duration::from_millis(500))?;
        Ok(None)
    });
    let supervisor = start_supervisor(&factory, fast_config());
    let ctx = Context::background();
    let proposal = proposal(33, 33, Vec::new());

    // 1. Start preparing.
    let first = supervisor.new_proposal(&ctx, proposal.clone(), init_voteproof(33, 33));
    assert!(wait_until(RESULT_TIMEOUT, || {
        supervisor.current_state(proposal.hash()) == Some(ProcessorState::Preparing)
    }));

    // 2. The same proposal is ignored while it is being prepared.
    log::debug!("Submitting the same proposal while it is being prepared.");
    let result = supervisor
        .new_proposal(&ctx, proposal.clone(), init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();
    let err = result.err.unwrap();
    assert!(err.is_ignored());
    assert!(err.to_string().contains("already preparing"), "{}", err);

    // 3. The first request finishes normally, and then the proposal is ignored as already prepared.
    let result = first.recv_timeout(RESULT_TIMEOUT).unwrap();
    assert!(result.err.is_none(), "unexpected error: {:?}", result.err);
    assert!(result.block.is_none());

    let result = supervisor
        .new_proposal(&ctx, proposal, init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();
    assert!(result.err.unwrap().to_string().contains("already prepared"));
    assert_eq!(factory.created().len(), 1);
}

#[test]
fn proposal_checker_test() {
    setup_logger(LevelFilter::Trace);

    let factory = DummyProcessorFactory::new();
    let mut supervisor = Supervisor::new(
        fast_config(),
        factory.new_fn(),
        Some(Box::new(|_: &Proposal| Err(ProcessError::failed("checker pong pong")))),
    );
    supervisor.start();

    log::debug!("Submitting a proposal the checker rejects.");
    let result = supervisor
        .new_proposal(&Context::background(), proposal(33, 33, Vec::new()), init_voteproof(33, 33))
        .recv_timeout(RESULT_TIMEOUT)
        .unwrap();

    let err = result.err.unwrap();
    assert!(err.is_prepare_failed());
    assert!(err.to_string().contains("checker pong pong"), "{}", err);
    assert!(supervisor.current().is_none());
    assert!(factory.created().is_empty());
}

#[test]
fn stop_cancels_prepare_test() {
    setup_logger(LevelFilter::Trace);

    let factory = DummyProcessorFactory::new().with_prepare(|ctx, _, _| {
        ctx.sleep(Duration::from_secs(3600))?;
        Ok(None)
    });
    let mut supervisor = start_supervisor(&factory, fast_config());
    let proposal = proposal(33, 33, Vec::new());

    // 1. Start preparing a proposal that never finishes on its own.
    let receiver = supervisor.new_proposal(&Context::background(), proposal.clone(), init_voteproof(33, 33));
    assert!(wait_until(RESULT_TIMEOUT, || {
        supervisor.current_state(proposal.hash()) == Some(ProcessorState::Preparing)
    }));

    // 2. Stopping the supervisor ends the prepare.
    log::debug!("Stopping the supervisor while a proposal is being prepared.");
    supervisor.stop();
    assert!(!supervisor.is_running());

    let result = receiver.recv_timeout(RESULT_TIMEOUT).unwrap();
    let err = result.err.unwrap();
    assert!(err.is_context(), "{}", err);
    assert!(err.to_string().contains("context canceled"), "{}", err);
}
