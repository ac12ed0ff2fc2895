/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! blockproc-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the event in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [NEW_PROCESSOR] event is printed:
//!
//! ```text
//! NewProcessor, 1701329264, fNGCJyk, 33, 0
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the proposal hash.
//! - The fourth value is the height of the proposal.
//! - The fifth value is the round of the proposal.
//!
//! Lifecycle events are logged at `info`, per-item and per-attempt events at `debug`, and failed
//! requests at `error`.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

// Names of each event in PascalCase for printing:
pub const NEW_PROCESSOR: &str = "NewProcessor";
pub const CANCEL_PROCESSOR: &str = "CancelProcessor";
pub const PREPARE_BLOCK: &str = "PrepareBlock";
pub const SAVE_BLOCK: &str = "SaveBlock";
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const SAVE_BLOCK_DATA: &str = "SaveBlockData";

pub const IGNORE_REQUEST: &str = "IgnoreRequest";
pub const FAIL_REQUEST: &str = "FailRequest";
pub const RETRY: &str = "Retry";
pub const WAIT_PREPARING: &str = "WaitPreparing";
pub const FAIL_OPERATION: &str = "FailOperation";
pub const WRITE_BLOCK_DATA_ITEM: &str = "WriteBlockDataItem";

pub(crate) mod info {
    use super::*;
    use crate::{
        block_data::BlockDataMap,
        proposal_processor::ProcessorState,
        types::{block::Block, proposal::Proposal},
    };

    pub(crate) fn new_processor(proposal: &Proposal) {
        log::info!(
            "{}, {}, {}, {}, {}",
            NEW_PROCESSOR,
            secs_since_unix_epoch(SystemTime::now()),
            first_seven_base64_chars(proposal.hash().bytes()),
            proposal.height(),
            proposal.round()
        )
    }

    pub(crate) fn cancel_processor(proposal: &Proposal, state: ProcessorState) {
        log::info!(
            "{}, {}, {}, {}, {}",
            CANCEL_PROCESSOR,
            secs_since_unix_epoch(SystemTime::now()),
            first_seven_base64_chars(proposal.hash().bytes()),
            proposal.height(),
            state
        )
    }

    pub(crate) fn prepare_block(proposal: &Proposal, block: Option<&Block>) {
        log::info!(
            "{}, {}, {}, {}, {}",
            PREPARE_BLOCK,
            secs_since_unix_epoch(SystemTime::now()),
            first_seven_base64_chars(proposal.hash().bytes()),
            proposal.height(),
            block_info(block)
        )
    }

    pub(crate) fn save_block(proposal: &Proposal, block: Option<&Block>) {
        log::info!(
            "{}, {}, {}, {}, {}",
            SAVE_BLOCK,
            secs_since_unix_epoch(SystemTime::now()),
            first_seven_base64_chars(proposal.hash().bytes()),
            proposal.height(),
            block_info(block)
        )
    }

    pub(crate) fn commit_block(block: &Block) {
        log::info!(
            "{}, {}, {}, {}, {}, {}",
            COMMIT_BLOCK,
            secs_since_unix_epoch(SystemTime::now()),
            first_seven_base64_chars(block.hash().bytes()),
            block.height(),
            block.operations.len(),
            block.states.len()
        )
    }

    pub(crate) fn saved_block_data(map: &BlockDataMap) {
        log::info!(
            "{}, {}, {}, {}, {}",
            SAVE_BLOCK_DATA,
            secs_since_unix_epoch(SystemTime::now()),
            map.hash()
                .map_or_else(|| String::from("-"), |hash| first_seven_base64_chars(hash.bytes())),
            map.height(),
            map.block()
                .map_or_else(|| String::from("-"), |hash| first_seven_base64_chars(hash.bytes()))
        )
    }

    fn block_info(block: Option<&Block>) -> String {
        match block {
            Some(block) => first_seven_base64_chars(block.hash().bytes()),
            None => String::from("-"),
        }
    }
}

pub(crate) mod debug {
    use super::*;
    use crate::{
        block_data::BlockDataMapItem,
        proposal_processor::ProcessError,
        types::{basic::Height, crypto_primitives::ValueHash, operation::OperationError},
    };

    pub(crate) fn ignore_request(request: &str, proposal: &ValueHash, err: &ProcessError) {
        log::debug!(
            "{}, {}, {}, {}, {}",
            IGNORE_REQUEST,
            secs_since_unix_epoch(SystemTime::now()),
            request,
            first_seven_base64_chars(proposal.bytes()),
            err
        )
    }

    pub(crate) fn retry(phase: &str, proposal: &ValueHash, attempt: u32, err: &ProcessError) {
        log::debug!(
            "{}, {}, {}, {}, {}, {}",
            RETRY,
            secs_since_unix_epoch(SystemTime::now()),
            phase,
            first_seven_base64_chars(proposal.bytes()),
            attempt,
            err
        )
    }

    pub(crate) fn wait_preparing(proposal: &ValueHash) {
        log::debug!(
            "{}, {}, {}",
            WAIT_PREPARING,
            secs_since_unix_epoch(SystemTime::now()),
            first_seven_base64_chars(proposal.bytes())
        )
    }

    pub(crate) fn operation_failed(fact: &ValueHash, err: &OperationError) {
        log::debug!(
            "{}, {}, {}, {}",
            FAIL_OPERATION,
            secs_since_unix_epoch(SystemTime::now()),
            first_seven_base64_chars(fact.bytes()),
            err
        )
    }

    pub(crate) fn block_data_item_written(height: Height, item: &BlockDataMapItem) {
        log::debug!(
            "{}, {}, {}, {}, {}",
            WRITE_BLOCK_DATA_ITEM,
            secs_since_unix_epoch(SystemTime::now()),
            height,
            item.data_type(),
            item.checksum()
        )
    }
}

pub(crate) mod error {
    use super::*;
    use crate::{proposal_processor::ProcessError, types::crypto_primitives::ValueHash};

    pub(crate) fn fail_request(request: &str, proposal: &ValueHash, err: &ProcessError) {
        log::error!(
            "{}, {}, {}, {}, {}",
            FAIL_REQUEST,
            secs_since_unix_epoch(SystemTime::now()),
            request,
            first_seven_base64_chars(proposal.bytes()),
            err
        )
    }
}

/// Log a failed request at `debug` if it was ignored and at `error` otherwise.
pub(crate) fn request_failed(
    request: &str,
    proposal: &crate::types::crypto_primitives::ValueHash,
    err: &crate::proposal_processor::ProcessError,
) {
    if err.is_ignored() {
        debug::ignore_request(request, proposal, err)
    } else {
        error::fail_request(request, proposal, err)
    }
}

pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

pub(crate) fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
