/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use serde::{Deserialize, Serialize};

use super::{
    basic::Height,
    crypto_primitives::ValueHash,
    hint::{Hint, HintType},
};

/// A keyed piece of application state, as committed by some block or staged by the current one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "_hint")]
    hint: Hint,
    key: String,
    #[serde(with = "hex")]
    value: Vec<u8>,
    hash: ValueHash,
    height: Height,
    /// Fact hashes of the operations that produced this value.
    operations: Vec<ValueHash>,
}

impl State {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x40]), 0, 0, 1);

    pub fn new(key: impl Into<String>, value: Vec<u8>, height: Height) -> Self {
        let key = key.into();
        let hash = Self::generate_hash(&key, &value);
        Self {
            hint: Self::HINT,
            key,
            value,
            hash,
            height,
            operations: Vec::new(),
        }
    }

    /// An empty state for a key that has never been written.
    pub fn empty(key: impl Into<String>, height: Height) -> Self {
        Self::new(key, Vec::new(), height)
    }

    pub fn generate_hash(key: &str, value: &[u8]) -> ValueHash {
        ValueHash::sha256(&[key.as_bytes(), value])
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn hash(&self) -> &ValueHash {
        &self.hash
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn operations(&self) -> &[ValueHash] {
        &self.operations
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
        self.hash = Self::generate_hash(&self.key, &self.value);
    }

    pub fn set_height(&mut self, height: Height) {
        self.height = height;
    }

    pub fn add_operation(&mut self, fact: ValueHash) {
        if !self.operations.contains(&fact) {
            self.operations.push(fact);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// A state may enter a states tree only with a non-empty value and a matching hash.
    pub fn is_valid(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("empty state key".to_string());
        }
        if self.value.is_empty() {
            return Err(format!("empty value for state {}", self.key));
        }
        if self.hash != Self::generate_hash(&self.key, &self.value) {
            return Err(format!("hash does not match for state {}", self.key));
        }

        Ok(())
    }
}
