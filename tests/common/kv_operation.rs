//! A key-value operation whose behavior during execution is part of its payload.

use std::{sync::Arc, thread, time::Duration};

use blockproc_rs::{
    state_pool::StatePool,
    types::{
        crypto_primitives::ValueHash,
        hint::{Hint, HintType},
        operation::{Operation, OperationDecoder, OperationDecoders, OperationError, ReasonError},
        state::State,
    },
};
use serde::{Deserialize, Serialize};

pub(crate) const KV_OPERATION_HINT: Hint = Hint::new(HintType::new([0xa0, 0x01]), 0, 0, 1);

/// What the operation does when it is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Behavior {
    /// Stage `key = value`.
    Set,
    /// Fail `pre_process` with an ignored error.
    IgnoreInPreProcess,
    /// Fail `process` with a reason error.
    Reason,
    /// Fail `process` with an error that ends the batch.
    Fatal,
    /// Stage `key = value` and add a second operation that sets `<key>-spawned`.
    Spawn,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct KvOperation {
    #[serde(rename = "_hint")]
    hint: Hint,
    hash: ValueHash,
    fact_hash: ValueHash,
    key: String,
    #[serde(with = "hex")]
    value: Vec<u8>,
    behavior: Behavior,
    nonce: u64,
    #[serde(default)]
    delay_ms: u64,
}

impl KvOperation {
    pub(crate) fn new(key: &str, value: &[u8], behavior: Behavior, nonce: u64) -> KvOperation {
        let behavior_bytes = serde_json::to_vec(&behavior).unwrap();
        let nonce_bytes = nonce.to_le_bytes();
        let fact_hash = ValueHash::sha256(&[
            key.as_bytes(),
            value,
            behavior_bytes.as_slice(),
            nonce_bytes.as_slice(),
        ]);
        let hash = ValueHash::sha256(&[fact_hash.bytes(), b"kv-operation".as_slice()]);

        KvOperation {
            hint: KV_OPERATION_HINT,
            hash,
            fact_hash,
            key: key.to_string(),
            value: value.to_vec(),
            behavior,
            nonce,
            delay_ms: 0,
        }
    }

    pub(crate) fn set(key: &str, value: &[u8]) -> KvOperation {
        KvOperation::new(key, value, Behavior::Set, 0)
    }

    /// Make `process` sleep before doing anything.
    pub(crate) fn with_delay(mut self, delay: Duration) -> KvOperation {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn into_arc(self) -> Arc<dyn Operation> {
        Arc::new(self)
    }
}

impl Operation for KvOperation {
    fn hint(&self) -> &Hint {
        &self.hint
    }

    fn hash(&self) -> &ValueHash {
        &self.hash
    }

    fn fact_hash(&self) -> &ValueHash {
        &self.fact_hash
    }

    fn pre_process(&self, _pool: &StatePool) -> Result<(), OperationError> {
        match self.behavior {
            Behavior::IgnoreInPreProcess => Err(OperationError::Ignored(format!("{} is ignored", self.key))),
            _ => Ok(()),
        }
    }

    fn process(&self, pool: &StatePool) -> Result<(), OperationError> {
        if self.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.delay_ms));
        }

        match self.behavior {
            Behavior::Set | Behavior::IgnoreInPreProcess => {
                pool.set(&self.fact_hash, vec![State::new(&self.key, self.value.clone(), pool.height())])?;
            }
            Behavior::Reason => {
                return Err(ReasonError::new(format!("{} has a reason", self.key)).into());
            }
            Behavior::Fatal => return Err(OperationError::Other(format!("{} is fatal", self.key))),
            Behavior::Spawn => {
                pool.set(&self.fact_hash, vec![State::new(&self.key, self.value.clone(), pool.height())])?;
                let spawned = KvOperation::new(&format!("{}-spawned", self.key), &self.value, Behavior::Set, self.nonce);
                pool.add_operations(vec![spawned.into_arc()]);
            }
        }

        Ok(())
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

fn decode_kv_operation(record: serde_json::Value) -> Result<Arc<dyn Operation>, serde_json::Error> {
    let operation: KvOperation = serde_json::from_value(record)?;
    Ok(Arc::new(operation))
}

/// Decoders that can read back [`KvOperation`] records.
pub(crate) fn kv_decoders() -> OperationDecoders {
    let mut decoders = OperationDecoders::new();
    decoders
        .add(KV_OPERATION_HINT, decode_kv_operation as OperationDecoder)
        .unwrap();
    decoders
}
