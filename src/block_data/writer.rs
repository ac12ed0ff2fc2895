/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Encoding of block data files.
//!
//! A block data file (before compression) is a sequence of lines:
//!
//! ```text
//! {"hint":{"type":"0160","version":"0.0.1"},"items":3}
//! # index=0
//! {"index":0,"key":"...","hash":"...","extra":"..."}
//! # index=1
//! ...
//! ```
//!
//! The first line is the [`BlockDataHeader`]. `items` is the number of entries for trees and `1` for
//! single records; list streams (operations, states) are written in bursts and leave it out. After the
//! header, `# index=<n>` comments set the slot of the entry on the next line, so entries may appear in any
//! order.

use std::{
    collections::BTreeMap,
    io::{BufRead, Write},
    sync::Arc,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    fixed_tree::{FixedTree, FixedTreeNode},
    types::{
        hint::{Hint, HintType},
        operation::{decode_operation, Operation, OperationDecoders},
        state::State,
    },
};

use super::BlockDataError;

const INDEX_PREFIX: &str = "# index=";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataHeader {
    pub hint: Hint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<u64>,
}

/// Writes and reads the line-delimited JSON encoding of block data.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockDataWriter;

impl BlockDataWriter {
    pub const HINT: Hint = Hint::new(HintType::new([0x01, 0x71]), 0, 0, 1);

    pub fn hint(&self) -> Hint {
        Self::HINT
    }

    pub fn write_header<W: Write>(&self, w: &mut W, hint: &Hint, items: Option<u64>) -> Result<(), BlockDataError> {
        let header = BlockDataHeader {
            hint: hint.clone(),
            items,
        };
        serde_json::to_writer(&mut *w, &header)?;
        w.write_all(b"\n")?;
        Ok(())
    }

    pub fn write_entry<W: Write, T: Serialize + ?Sized>(
        &self,
        w: &mut W,
        index: u64,
        entry: &T,
    ) -> Result<(), BlockDataError> {
        writeln!(w, "{}{}", INDEX_PREFIX, index)?;
        serde_json::to_writer(&mut *w, entry)?;
        w.write_all(b"\n")?;
        Ok(())
    }

    /// A single record: header with `items = 1` and one entry.
    pub fn write_item<W: Write, T: Serialize>(&self, w: &mut W, hint: &Hint, item: &T) -> Result<(), BlockDataError> {
        self.write_header(w, hint, Some(1))?;
        self.write_entry(w, 0, item)
    }

    pub fn write_tree<W: Write>(&self, w: &mut W, tree: &FixedTree) -> Result<(), BlockDataError> {
        self.write_header(w, tree.hint(), Some(tree.len() as u64))?;
        for node in tree.nodes() {
            self.write_entry(w, node.index(), node)?;
        }
        Ok(())
    }

    /// Parse a stream into its header and its entries ordered by index.
    pub fn read<R: BufRead>(&self, r: R) -> Result<(BlockDataHeader, Vec<serde_json::Value>), BlockDataError> {
        let mut header: Option<BlockDataHeader> = None;
        let mut entries: BTreeMap<u64, serde_json::Value> = BTreeMap::new();
        let mut pending_index: Option<u64> = None;

        for line in r.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if header.is_none() {
                header = Some(serde_json::from_str(line)?);
                continue;
            }

            if let Some(index) = line.strip_prefix(INDEX_PREFIX) {
                let index = index
                    .trim()
                    .parse()
                    .map_err(|_| BlockDataError::InvalidInput(format!("invalid index comment, {:?}", line)))?;
                pending_index = Some(index);
                continue;
            }

            let index = match pending_index.take() {
                Some(index) => index,
                None => entries.keys().next_back().map_or(0, |last| last + 1),
            };
            if entries.insert(index, serde_json::from_str(line)?).is_some() {
                return Err(BlockDataError::InvalidInput(format!("duplicated index, {}", index)));
            }
        }

        let header = header.ok_or_else(|| BlockDataError::InvalidInput("empty block data stream".to_string()))?;
        if let Some(items) = header.items {
            if items != entries.len() as u64 {
                return Err(BlockDataError::InvalidInput(format!(
                    "expected {} items, found {}",
                    items,
                    entries.len()
                )));
            }
        }

        Ok((header, entries.into_values().collect()))
    }

    pub fn read_item<R: BufRead, T: DeserializeOwned>(&self, r: R) -> Result<T, BlockDataError> {
        let (_, entries) = self.read(r)?;
        let mut entries = entries.into_iter();
        match (entries.next(), entries.next()) {
            (Some(entry), None) => Ok(serde_json::from_value(entry)?),
            _ => Err(BlockDataError::InvalidInput("expected exactly one item".to_string())),
        }
    }

    pub fn read_tree<R: BufRead>(&self, r: R) -> Result<FixedTree, BlockDataError> {
        let (header, entries) = self.read(r)?;
        if !header.hint.is_compatible(&FixedTree::HINT) {
            return Err(BlockDataError::InvalidInput(format!("not tree hint, {}", header.hint)));
        }

        let nodes = entries
            .into_iter()
            .map(serde_json::from_value::<FixedTreeNode>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FixedTree::new(nodes))
    }

    pub fn read_states<R: BufRead>(&self, r: R) -> Result<Vec<State>, BlockDataError> {
        let (_, entries) = self.read(r)?;
        Ok(entries
            .into_iter()
            .map(serde_json::from_value::<State>)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn read_operations<R: BufRead>(
        &self,
        r: R,
        decoders: &OperationDecoders,
    ) -> Result<Vec<Arc<dyn Operation>>, BlockDataError> {
        let (_, entries) = self.read(r)?;
        Ok(entries
            .into_iter()
            .map(|entry| decode_operation(decoders, entry))
            .collect::<Result<Vec<_>, _>>()?)
    }
}
