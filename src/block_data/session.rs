/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Scratch space for writing the block data of one height.
//!
//! Each artifact is written to `<session root>/.<data type>.gz`, then checksummed and renamed to its
//! content-addressed file name, and recorded in the session's [`BlockDataMap`]. Every data type has its
//! own lock, held from the first write of an artifact until its file is renamed, so that writers of
//! different artifacts never wait on each other and the map only ever records finished files.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use flate2::{write::GzEncoder, Compression};

use crate::{
    fixed_tree::FixedTree,
    logging::debug,
    types::{
        basic::{Height, Stage},
        block::{Block, Manifest, SuffrageInfo},
        crypto_primitives::{CryptoHasher, Digest},
        hint::Hint,
        operation::Operation,
        proposal::Proposal,
        state::State,
        voteproof::Voteproof,
    },
};

use super::{
    data_file_name,
    map::{BlockDataMap, BlockDataMapItem},
    BlockDataError, BlockDataWriter, DataType,
};

struct ListStream {
    encoder: GzEncoder<File>,
    next_index: u64,
}

pub struct Session {
    height: Height,
    root: PathBuf,
    writer: BlockDataWriter,
    map: Mutex<BlockDataMap>,
    slots: HashMap<DataType, Mutex<Option<ListStream>>>,
}

impl Session {
    pub(crate) fn new(root: PathBuf, height: Height, writer: BlockDataWriter) -> Self {
        Self {
            height,
            root,
            writer,
            map: Mutex::new(BlockDataMap::new(height, writer.hint())),
            slots: DataType::ALL
                .into_iter()
                .map(|data_type| (data_type, Mutex::new(None)))
                .collect(),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    /// The session's scratch directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the map as written so far.
    pub fn map(&self) -> BlockDataMap {
        lock(&self.map).clone()
    }

    fn temp_path(&self, data_type: DataType) -> PathBuf {
        self.root.join(format!(".{}.gz", data_type))
    }

    fn slot(&self, data_type: DataType) -> MutexGuard<'_, Option<ListStream>> {
        // Safety: `slots` holds every data type.
        lock(&self.slots[&data_type])
    }

    /// Write a whole artifact in one go.
    fn write_with<F>(&self, data_type: DataType, f: F) -> Result<BlockDataMapItem, BlockDataError>
    where
        F: FnOnce(&mut GzEncoder<File>) -> Result<(), BlockDataError>,
    {
        let _slot = self.slot(data_type);

        let mut encoder = GzEncoder::new(File::create(self.temp_path(data_type))?, Compression::default());
        f(&mut encoder)?;
        encoder.finish()?.sync_all()?;

        self.finalize(data_type)
    }

    /// Checksum the temp file of `data_type`, move it to its final name and record it in the map.
    fn finalize(&self, data_type: DataType) -> Result<BlockDataMapItem, BlockDataError> {
        let temp = self.temp_path(data_type);
        let checksum = checksum_file(&temp)?;
        let path = self.root.join(data_file_name(self.height, data_type, &checksum));
        fs::rename(&temp, &path)?;

        let item = BlockDataMapItem::local(data_type, checksum, &path);
        let previous = lock(&self.map).set_item(item.clone());
        if let Some(previous) = previous.and_then(|previous| previous.local_path(&self.root)) {
            if previous != path {
                remove_file_if_exists(&previous)?;
            }
        }

        debug::block_data_item_written(self.height, &item);
        Ok(item)
    }

    fn open_stream(&self, data_type: DataType, hint: &Hint) -> Result<ListStream, BlockDataError> {
        let mut encoder = GzEncoder::new(File::create(self.temp_path(data_type))?, Compression::default());
        self.writer.write_header(&mut encoder, hint, None)?;
        Ok(ListStream {
            encoder,
            next_index: 0,
        })
    }

    fn add_entries<T, F>(&self, data_type: DataType, entries: &[T], to_entry: F) -> Result<(), BlockDataError>
    where
        F: Fn(&T) -> Result<serde_json::Value, BlockDataError>,
    {
        let mut slot = self.slot(data_type);
        if slot.is_none() {
            *slot = Some(self.open_stream(data_type, &list_hint(data_type))?);
        }

        if let Some(stream) = slot.as_mut() {
            for entry in entries {
                self.writer
                    .write_entry(&mut stream.encoder, stream.next_index, &to_entry(entry)?)?;
                stream.next_index += 1;
            }
        }

        Ok(())
    }

    fn close_entries(&self, data_type: DataType) -> Result<BlockDataMapItem, BlockDataError> {
        let mut slot = self.slot(data_type);
        let stream = match slot.take() {
            Some(stream) => stream,
            None => self.open_stream(data_type, &list_hint(data_type))?,
        };
        stream.encoder.finish()?.sync_all()?;

        self.finalize(data_type)
    }

    pub fn set_manifest(&self, manifest: &Manifest) -> Result<BlockDataMapItem, BlockDataError> {
        let item = self.write_with(DataType::Manifest, |w| {
            self.writer.write_item(w, manifest.hint(), manifest)
        })?;
        lock(&self.map).set_block(manifest.hash().clone());
        Ok(item)
    }

    /// Append operations to the operations stream.
    pub fn add_operations(&self, operations: &[Arc<dyn Operation>]) -> Result<(), BlockDataError> {
        self.add_entries(DataType::Operations, operations, |operation| {
            Ok(operation.to_json()?)
        })
    }

    pub fn close_operations(&self) -> Result<BlockDataMapItem, BlockDataError> {
        self.close_entries(DataType::Operations)
    }

    pub fn set_operations(&self, operations: &[Arc<dyn Operation>]) -> Result<BlockDataMapItem, BlockDataError> {
        self.add_operations(operations)?;
        self.close_operations()
    }

    pub fn set_operations_tree(&self, tree: &FixedTree) -> Result<BlockDataMapItem, BlockDataError> {
        self.write_with(DataType::OperationsTree, |w| self.writer.write_tree(w, tree))
    }

    /// Append states to the states stream.
    pub fn add_states(&self, states: &[State]) -> Result<(), BlockDataError> {
        self.add_entries(DataType::States, states, |state| Ok(serde_json::to_value(state)?))
    }

    pub fn close_states(&self) -> Result<BlockDataMapItem, BlockDataError> {
        self.close_entries(DataType::States)
    }

    pub fn set_states(&self, states: &[State]) -> Result<BlockDataMapItem, BlockDataError> {
        self.add_states(states)?;
        self.close_states()
    }

    pub fn set_states_tree(&self, tree: &FixedTree) -> Result<BlockDataMapItem, BlockDataError> {
        self.write_with(DataType::StatesTree, |w| self.writer.write_tree(w, tree))
    }

    pub fn set_init_voteproof(&self, voteproof: &Voteproof) -> Result<BlockDataMapItem, BlockDataError> {
        if voteproof.stage() != Stage::Init {
            return Err(BlockDataError::InvalidInput(format!(
                "not init voteproof, {}",
                voteproof.stage()
            )));
        }
        self.write_with(DataType::InitVoteproof, |w| {
            self.writer.write_item(w, voteproof.hint(), voteproof)
        })
    }

    pub fn set_accept_voteproof(&self, voteproof: &Voteproof) -> Result<BlockDataMapItem, BlockDataError> {
        if voteproof.stage() != Stage::Accept {
            return Err(BlockDataError::InvalidInput(format!(
                "not accept voteproof, {}",
                voteproof.stage()
            )));
        }
        self.write_with(DataType::AcceptVoteproof, |w| {
            self.writer.write_item(w, voteproof.hint(), voteproof)
        })
    }

    pub fn set_suffrage_info(&self, suffrage_info: &SuffrageInfo) -> Result<BlockDataMapItem, BlockDataError> {
        self.write_with(DataType::SuffrageInfo, |w| {
            self.writer.write_item(w, &SuffrageInfo::HINT, suffrage_info)
        })
    }

    pub fn set_proposal(&self, proposal: &Proposal) -> Result<BlockDataMapItem, BlockDataError> {
        self.write_with(DataType::Proposal, |w| {
            self.writer.write_item(w, &Proposal::HINT, proposal)
        })
    }

    /// Write every artifact of `block`. The block must carry its ACCEPT voteproof.
    pub fn set_block(&self, block: &Block) -> Result<(), BlockDataError> {
        let accept_voteproof = block
            .consensus_info
            .accept_voteproof
            .as_ref()
            .ok_or_else(|| BlockDataError::InvalidInput("block without accept voteproof".to_string()))?;

        self.set_manifest(&block.manifest)?;
        self.set_operations(&block.operations)?;
        self.set_operations_tree(&block.operations_tree)?;
        self.set_states(&block.states)?;
        self.set_states_tree(&block.states_tree)?;
        self.set_init_voteproof(&block.consensus_info.init_voteproof)?;
        self.set_accept_voteproof(accept_voteproof)?;
        self.set_suffrage_info(&block.consensus_info.suffrage_info)?;
        self.set_proposal(&block.consensus_info.proposal)?;

        Ok(())
    }

    /// Store an already-encoded (gzip) artifact as is.
    pub fn import<R: Read>(&self, data_type: DataType, mut r: R) -> Result<BlockDataMapItem, BlockDataError> {
        let _slot = self.slot(data_type);

        let mut file = File::create(self.temp_path(data_type))?;
        io::copy(&mut r, &mut file)?;
        file.sync_all()?;
        drop(file);

        self.finalize(data_type)
    }

    /// Seal the session: every item present, map hashed and valid, every file on disk.
    pub fn done(&self) -> Result<BlockDataMap, BlockDataError> {
        let mut map = lock(&self.map);
        map.is_ready_to_hash()?;
        map.update_hash()?;
        map.is_valid()?;
        map.exists(&self.root)?;

        Ok(map.clone())
    }

    /// Drop everything written so far.
    pub fn cancel(&self) -> Result<(), BlockDataError> {
        for data_type in DataType::ALL {
            self.slot(data_type).take();
        }
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn list_hint(data_type: DataType) -> Hint {
    match data_type {
        DataType::States => State::HINT,
        _ => BlockDataWriter::HINT,
    }
}

/// Hex SHA-256 of a file's bytes.
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut hasher = CryptoHasher::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
