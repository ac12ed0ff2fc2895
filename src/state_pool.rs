/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-block staging area for state updates.
//!
//! A [`StatePool`] is created for one block and shared by every worker executing that block's
//! operations. [`get`](StatePool::get) always answers with the committed value (read through from the
//! database and cached), never with values staged by other operations of the same block.
//! [`set`](StatePool::set) records tentative updates, which only become visible as the block's states
//! once execution is finished.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;

use crate::{
    database::{Database, DatabaseError},
    types::{basic::Height, crypto_primitives::ValueHash, operation::Operation, state::State},
};

type StateFetcher = Box<dyn Fn(&str) -> Result<Option<State>, DatabaseError> + Send + Sync>;

pub struct StatePool {
    height: Height,
    from_store: StateFetcher,
    inner: RwLock<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    cached: HashMap<String, (State, bool)>,
    updated: BTreeMap<String, State>,
    inserted_operations: Vec<ValueHash>,
    inserted_set: HashSet<ValueHash>,
    added_operations: BTreeMap<Vec<u8>, Arc<dyn Operation>>,
}

impl StatePool {
    /// A pool for the block at `height`, reading committed states through `from_store`.
    pub fn new(
        height: Height,
        from_store: impl Fn(&str) -> Result<Option<State>, DatabaseError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            height,
            from_store: Box::new(from_store),
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// A pool for the block after the database's last committed block.
    pub fn from_database(database: Arc<dyn Database>) -> Result<Self, DatabaseError> {
        let height = match database.last_manifest()? {
            Some(manifest) => manifest.height() + 1,
            None => Height::new(0),
        };
        Ok(Self::new(height, move |key| database.state(key)))
    }

    /// Height of the block whose states are staged.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Committed value of `key`, and whether it exists. A missing state is returned empty.
    pub fn get(&self, key: &str) -> Result<(State, bool), StatePoolError> {
        if let Some((state, exists)) = self.read().cached.get(key) {
            return Ok((state.clone(), *exists));
        }

        let (state, exists) = match (self.from_store)(key)? {
            Some(state) => (state, true),
            None => (State::empty(key, self.height), false),
        };

        self.write()
            .cached
            .entry(key.to_string())
            .or_insert_with(|| (state.clone(), exists));

        Ok((state, exists))
    }

    /// Stage `states` as produced by the operation with fact hash `fact`.
    pub fn set(&self, fact: &ValueHash, states: Vec<State>) -> Result<(), StatePoolError> {
        if let Some(state) = states.iter().find(|state| state.key().is_empty()) {
            return Err(StatePoolError::InvalidState(format!(
                "empty key for state with value {}",
                hex::encode(state.value())
            )));
        }

        let mut inner = self.write();
        for state in states {
            let updated = inner
                .updated
                .entry(state.key().to_string())
                .or_insert_with(|| state.clone());
            updated.set_value(state.value().to_vec());
            updated.set_height(self.height);
            updated.add_operation(fact.clone());
        }
        if inner.inserted_set.insert(fact.clone()) {
            inner.inserted_operations.push(fact.clone());
        }

        Ok(())
    }

    /// Staged states, sorted by key.
    pub fn updates(&self) -> Vec<State> {
        self.read().updated.values().cloned().collect()
    }

    pub fn is_updated(&self) -> bool {
        !self.read().updated.is_empty()
    }

    /// Fact hashes of the operations that staged at least one state, in first-staged order.
    pub fn inserted_operations(&self) -> Vec<ValueHash> {
        self.read().inserted_operations.clone()
    }

    /// Collect operations created as side effects of executing the block.
    pub fn add_operations(&self, operations: Vec<Arc<dyn Operation>>) {
        let mut inner = self.write();
        for operation in operations {
            inner
                .added_operations
                .insert(operation.fact_hash().bytes().to_vec(), operation);
        }
    }

    /// Side-effect operations, ordered by fact hash bytes so that every node appends them identically.
    pub fn added_operations(&self) -> Vec<Arc<dyn Operation>> {
        self.read().added_operations.values().cloned().collect()
    }

    /// Drop everything staged and cached.
    pub fn done(&self) {
        *self.write() = PoolInner::default();
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StatePoolError {
    #[error("invalid state; {0}")]
    InvalidState(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}
