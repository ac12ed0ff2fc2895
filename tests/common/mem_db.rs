//! A simple, volatile, in-memory implementation of [`Database`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use blockproc_rs::{
    block_data::BlockDataMap,
    database::{Database, DatabaseError},
    types::{
        block::{Block, Manifest},
        crypto_primitives::ValueHash,
        operation::Operation,
        state::State,
    },
};

#[derive(Default)]
struct MemDatabaseInner {
    last_manifest: Option<Manifest>,
    states: HashMap<String, State>,
    facts: HashSet<ValueHash>,
    staged: HashMap<ValueHash, Arc<dyn Operation>>,
    commits: Vec<(Block, BlockDataMap)>,
    failing_commits: u32,
}

/// An in-memory implementation of [`Database`].
#[derive(Clone, Default)]
pub(crate) struct MemDatabase(Arc<Mutex<MemDatabaseInner>>);

impl MemDatabase {
    /// Create a new, empty `MemDatabase`.
    pub(crate) fn new() -> MemDatabase {
        MemDatabase::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemDatabaseInner> {
        self.0.lock().unwrap()
    }

    /// Put `operation` into the staging area, keyed by its hash.
    pub(crate) fn stage(&self, operation: Arc<dyn Operation>) {
        self.lock().staged.insert(operation.hash().clone(), operation);
    }

    pub(crate) fn set_state(&self, state: State) {
        self.lock().states.insert(state.key().to_string(), state);
    }

    /// Pretend that an operation with `fact` was committed by an earlier block.
    pub(crate) fn add_operation_fact(&self, fact: ValueHash) {
        self.lock().facts.insert(fact);
    }

    pub(crate) fn set_last_manifest(&self, manifest: Manifest) {
        self.lock().last_manifest = Some(manifest);
    }

    /// Make the next `count` commits fail.
    pub(crate) fn fail_next_commits(&self, count: u32) {
        self.lock().failing_commits = count;
    }

    pub(crate) fn committed_blocks(&self) -> Vec<Block> {
        self.lock().commits.iter().map(|(block, _)| block.clone()).collect()
    }

    pub(crate) fn committed_maps(&self) -> Vec<BlockDataMap> {
        self.lock().commits.iter().map(|(_, map)| map.clone()).collect()
    }
}

impl Database for MemDatabase {
    fn last_manifest(&self) -> Result<Option<Manifest>, DatabaseError> {
        Ok(self.lock().last_manifest.clone())
    }

    fn state(&self, key: &str) -> Result<Option<State>, DatabaseError> {
        Ok(self.lock().states.get(key).cloned())
    }

    fn has_operation_fact(&self, fact: &ValueHash) -> Result<bool, DatabaseError> {
        Ok(self.lock().facts.contains(fact))
    }

    fn staged_operation(&self, hash: &ValueHash) -> Result<Option<Arc<dyn Operation>>, DatabaseError> {
        Ok(self.lock().staged.get(hash).cloned())
    }

    fn commit(&self, block: &Block, map: &BlockDataMap) -> Result<(), DatabaseError> {
        let mut inner = self.lock();
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(DatabaseError::Other("commit failed".to_string()));
        }

        inner.last_manifest = Some(block.manifest.clone());
        for state in &block.states {
            inner.states.insert(state.key().to_string(), state.clone());
        }
        for operation in &block.operations {
            inner.facts.insert(operation.fact_hash().clone());
            inner.staged.remove(operation.hash());
        }
        inner.commits.push((block.clone(), map.clone()));

        Ok(())
    }
}
