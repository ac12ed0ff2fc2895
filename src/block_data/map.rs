/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block data map.
//!
//! ## Hash
//!
//! ```text
//! hash = SHA256(height ∥ created_at ∥ item(manifest) ∥ item(operations) ∥ ... ∥ item(proposal))
//! item = type ∥ checksum ∥ url
//! ```
//!
//! Items are concatenated in the canonical [`DataType`] order, so the hash does not depend on the order
//! in which the artifacts were written.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    basic::{time_bytes, Height},
    crypto_primitives::ValueHash,
    hint::{Hint, HintType},
};

use super::{BlockDataError, DataType};

pub const LOCAL_SCHEME: &str = "file";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataMapItem {
    #[serde(rename = "type")]
    data_type: DataType,
    checksum: String,
    url: String,
}

impl BlockDataMapItem {
    pub fn new(data_type: DataType, checksum: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            data_type,
            checksum: checksum.into(),
            url: url.into(),
        }
    }

    /// An item pointing at a local file.
    pub fn local(data_type: DataType, checksum: impl Into<String>, path: &Path) -> Self {
        Self::new(
            data_type,
            checksum,
            format!("{}://{}", LOCAL_SCHEME, path.to_string_lossy()),
        )
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = self.data_type.as_str().as_bytes().to_vec();
        bytes.extend_from_slice(self.checksum.as_bytes());
        bytes.extend_from_slice(self.url.as_bytes());
        bytes
    }

    fn split_url(&self) -> Option<(&str, &str)> {
        self.url
            .split_once("://")
            .filter(|(scheme, body)| !scheme.is_empty() && !body.is_empty())
    }

    pub fn scheme(&self) -> Option<&str> {
        self.split_url().map(|(scheme, _)| scheme)
    }

    /// The URL without its scheme.
    pub fn url_body(&self) -> Option<&str> {
        self.split_url().map(|(_, body)| body)
    }

    pub fn is_local(&self) -> bool {
        self.scheme() == Some(LOCAL_SCHEME)
    }

    /// Path of a local item; relative URL bodies are resolved against `root`.
    pub fn local_path(&self, root: &Path) -> Option<PathBuf> {
        if !self.is_local() {
            return None;
        }
        let body = Path::new(self.url_body()?);
        if body.is_absolute() {
            Some(body.to_path_buf())
        } else {
            Some(root.join(body))
        }
    }

    /// Whether the file behind a local item exists. Remote items are assumed to.
    pub fn exists(&self, root: &Path) -> bool {
        match self.local_path(root) {
            Some(path) => path.is_file(),
            None => !self.is_local(),
        }
    }

    pub fn is_valid(&self) -> Result<(), BlockDataError> {
        if self.checksum.is_empty() {
            return Err(BlockDataError::InvalidInput(format!(
                "empty checksum for {}",
                self.data_type
            )));
        }
        if self.split_url().is_none() {
            return Err(BlockDataError::InvalidInput(format!(
                "invalid url for {}, {:?}",
                self.data_type, self.url
            )));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataMap {
    #[serde(rename = "_hint")]
    hint: Hint,
    hash: Option<ValueHash>,
    height: Height,
    block: Option<ValueHash>,
    created_at: DateTime<Utc>,
    items: BTreeMap<DataType, BlockDataMapItem>,
    writer: Hint,
}

impl BlockDataMap {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x70]), 0, 0, 1);

    pub fn new(height: Height, writer: Hint) -> Self {
        Self {
            hint: Self::HINT,
            hash: None,
            height,
            block: None,
            created_at: Utc::now(),
            items: BTreeMap::new(),
            writer,
        }
    }

    pub fn hint(&self) -> &Hint {
        &self.hint
    }

    pub fn hash(&self) -> Option<&ValueHash> {
        self.hash.as_ref()
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn block(&self) -> Option<&ValueHash> {
        self.block.as_ref()
    }

    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }

    pub fn writer(&self) -> &Hint {
        &self.writer
    }

    pub fn items(&self) -> &BTreeMap<DataType, BlockDataMapItem> {
        &self.items
    }

    pub fn item(&self, data_type: DataType) -> Option<&BlockDataMapItem> {
        self.items.get(&data_type)
    }

    pub fn set_block(&mut self, block: ValueHash) {
        self.block = Some(block);
        self.hash = None;
    }

    /// Replace the item of its data type, returning the previous one.
    pub fn set_item(&mut self, item: BlockDataMapItem) -> Option<BlockDataMapItem> {
        self.hash = None;
        self.items.insert(item.data_type(), item)
    }

    /// Every data type has a valid item and the block hash is known.
    pub fn is_ready_to_hash(&self) -> Result<(), BlockDataError> {
        if self.block.as_ref().map_or(true, ValueHash::is_empty) {
            return Err(BlockDataError::InvalidInput("empty block hash".to_string()));
        }
        for data_type in DataType::ALL {
            let item = self.items.get(&data_type).ok_or_else(|| {
                BlockDataError::InvalidInput(format!("missing block data item, {}", data_type))
            })?;
            if item.data_type() != data_type {
                return Err(BlockDataError::InvalidInput(format!(
                    "item type mismatch, {} != {}",
                    item.data_type(),
                    data_type
                )));
            }
            item.is_valid()?;
        }

        Ok(())
    }

    pub fn generate_hash(&self) -> Result<ValueHash, BlockDataError> {
        self.is_ready_to_hash()?;

        let mut parts: Vec<Vec<u8>> = vec![self.height.to_le_bytes().to_vec(), time_bytes(&self.created_at)];
        parts.extend(self.items.values().map(BlockDataMapItem::bytes));

        Ok(ValueHash::sha256(&parts))
    }

    pub fn update_hash(&mut self) -> Result<(), BlockDataError> {
        self.hash = Some(self.generate_hash()?);
        Ok(())
    }

    /// Whether every item is a local file.
    pub fn is_local(&self) -> bool {
        !self.items.is_empty() && self.items.values().all(BlockDataMapItem::is_local)
    }

    pub fn is_valid(&self) -> Result<(), BlockDataError> {
        let hash = self
            .hash
            .as_ref()
            .ok_or_else(|| BlockDataError::InvalidInput("empty map hash".to_string()))?;

        let locals = self.items.values().filter(|item| item.is_local()).count();
        if locals != 0 && locals != self.items.len() {
            return Err(BlockDataError::InvalidInput(
                "local and remote items are mixed".to_string(),
            ));
        }
        if hash != &self.generate_hash()? {
            return Err(BlockDataError::InvalidInput("map hash does not match".to_string()));
        }

        Ok(())
    }

    /// Check that every local item's file exists under `root`.
    pub fn exists(&self, root: &Path) -> Result<(), BlockDataError> {
        match self.items.values().find(|item| !item.exists(root)) {
            Some(item) => Err(BlockDataError::NotFound(format!(
                "block data file for {}, {}",
                item.data_type(),
                item.url()
            ))),
            None => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BlockDataError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, BlockDataError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Compact binary encoding.
    pub fn to_borsh(&self) -> Result<Vec<u8>, BlockDataError> {
        let record = BlockDataMapRecord {
            hint: self.hint.to_string(),
            hash: self.hash.as_ref().map(HashRecord::from),
            height: self.height.int(),
            block: self.block.as_ref().map(HashRecord::from),
            created_at: self.created_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            items: self
                .items
                .values()
                .map(|item| {
                    (
                        item.data_type().as_str().to_string(),
                        item.checksum().to_string(),
                        item.url().to_string(),
                    )
                })
                .collect(),
            writer: self.writer.to_string(),
        };
        Ok(record.try_to_vec()?)
    }

    pub fn from_borsh(bytes: &[u8]) -> Result<Self, BlockDataError> {
        let record = BlockDataMapRecord::try_from_slice(bytes)?;
        let invalid = |err: String| BlockDataError::InvalidInput(err);

        let items = record
            .items
            .into_iter()
            .map(|(data_type, checksum, url)| {
                let data_type: DataType = data_type.parse()?;
                Ok((data_type, BlockDataMapItem::new(data_type, checksum, url)))
            })
            .collect::<Result<BTreeMap<_, _>, BlockDataError>>()?;

        Ok(Self {
            hint: record.hint.parse().map_err(|err| invalid(format!("{}", err)))?,
            hash: record.hash.map(HashRecord::into_hash).transpose()?,
            height: Height::new(record.height),
            block: record.block.map(HashRecord::into_hash).transpose()?,
            created_at: DateTime::parse_from_rfc3339(&record.created_at)
                .map_err(|err| invalid(err.to_string()))?
                .with_timezone(&Utc),
            items,
            writer: record.writer.parse().map_err(|err| invalid(format!("{}", err)))?,
        })
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct HashRecord {
    hint: String,
    bytes: Vec<u8>,
}

impl From<&ValueHash> for HashRecord {
    fn from(hash: &ValueHash) -> Self {
        Self {
            hint: hash.hint().to_string(),
            bytes: hash.bytes().to_vec(),
        }
    }
}

impl HashRecord {
    fn into_hash(self) -> Result<ValueHash, BlockDataError> {
        let hint = self
            .hint
            .parse()
            .map_err(|err| BlockDataError::InvalidInput(format!("{}", err)))?;
        Ok(ValueHash::new(hint, self.bytes))
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct BlockDataMapRecord {
    hint: String,
    hash: Option<HashRecord>,
    height: i64,
    block: Option<HashRecord>,
    created_at: String,
    items: Vec<(String, String, String)>,
    writer: String,
}
