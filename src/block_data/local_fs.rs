/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block data on the local filesystem.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   .session3f9a…/                 scratch directory of an open session
//!   000000000000000000033/         block data of height 33
//!     33-manifest-<checksum>.jsonld.gz
//!     ...
//!     map.json                     the block data map, written last
//!     .removed                     optional soft-delete marker (RFC 3339 time)
//! ```
//!
//! A session's files are moved into their height directory by per-file renames inside `root`, so a
//! committed height directory never holds a partially written file. The map file is written after every
//! data file is in place; a height directory without it is treated as absent.

use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{SecondsFormat, Utc};
use flate2::read::GzDecoder;
use rand_core::{OsRng, RngCore};
use serde::de::DeserializeOwned;

use crate::{
    fixed_tree::FixedTree,
    logging::info,
    types::{
        basic::Height,
        block::{Block, ConsensusInfo, Manifest, SuffrageInfo},
        operation::{Operation, OperationDecoders},
        proposal::Proposal,
        state::State,
        voteproof::Voteproof,
    },
};

use super::{
    height_directory,
    map::{BlockDataMap, BlockDataMapItem},
    parse_data_file_name,
    session::Session,
    BlockDataError, BlockDataWriter, DataType, MAP_FILE_NAME, REMOVED_MARKER,
};

const SESSION_PREFIX: &str = ".session";

pub struct LocalBlockData {
    root: PathBuf,
    writer: BlockDataWriter,
    lock: RwLock<()>,
}

impl LocalBlockData {
    /// Open the block data stored under `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>, writer: BlockDataWriter) -> Result<Self, BlockDataError> {
        let root = fs::canonicalize(root.as_ref()).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => BlockDataError::NotFound(format!("root, {}", root.as_ref().display())),
            _ => BlockDataError::Fs(err),
        })?;
        if !root.is_dir() {
            return Err(BlockDataError::InvalidInput(format!(
                "root is not directory, {}",
                root.display()
            )));
        }

        Ok(Self {
            root,
            writer,
            lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn writer(&self) -> BlockDataWriter {
        self.writer
    }

    pub fn height_path(&self, height: Height) -> PathBuf {
        self.root.join(height_directory(height))
    }

    /// Open a session in a fresh scratch directory under the root.
    pub fn new_session(&self, height: Height) -> Result<Session, BlockDataError> {
        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        let root = self
            .root
            .join(format!("{}{}", SESSION_PREFIX, hex::encode(suffix)));
        fs::create_dir(&root)?;

        Ok(Session::new(root, height, self.writer))
    }

    /// Move a finished session into its height directory, replacing whatever was stored for that
    /// height, and return the final map.
    pub fn save_session(&self, session: &Session) -> Result<BlockDataMap, BlockDataError> {
        let mut map = session.done()?;

        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let directory = height_directory(session.height());
        let path = self.root.join(&directory);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        let items: Vec<BlockDataMapItem> = map.items().values().cloned().collect();
        for item in items {
            let source = item.local_path(session.root()).ok_or_else(|| {
                BlockDataError::InvalidInput(format!("not local item, {}", item.url()))
            })?;
            let file_name = source
                .file_name()
                .ok_or_else(|| BlockDataError::InvalidInput(format!("invalid item path, {}", item.url())))?
                .to_owned();
            fs::rename(&source, path.join(&file_name))?;

            let relative = Path::new(&directory).join(&file_name);
            map.set_item(BlockDataMapItem::local(item.data_type(), item.checksum(), &relative));
        }

        map.update_hash()?;
        map.is_valid()?;
        map.exists(&self.root)?;

        let temp = path.join(format!(".{}", MAP_FILE_NAME));
        fs::write(&temp, map.to_json()?)?;
        fs::rename(&temp, path.join(MAP_FILE_NAME))?;

        session.cancel()?;

        info::saved_block_data(&map);
        Ok(map)
    }

    /// Whether complete block data for `height` exists and is not marked removed.
    pub fn exists(&self, height: Height) -> Result<bool, BlockDataError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.is_saved(height))
    }

    /// Caller holds `lock`.
    fn is_saved(&self, height: Height) -> bool {
        let path = self.height_path(height);
        path.join(MAP_FILE_NAME).is_file() && !path.join(REMOVED_MARKER).exists()
    }

    /// Whether a directory for `height` exists, removed or not.
    pub fn exists_real(&self, height: Height) -> Result<bool, BlockDataError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.height_path(height).is_dir())
    }

    /// Mark the block data of `height` as removed, leaving the files on disk.
    pub fn remove(&self, height: Height) -> Result<(), BlockDataError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        if !self.is_saved(height) {
            return Err(BlockDataError::NotFound(format!("block data, height={}", height)));
        }

        fs::write(
            self.height_path(height).join(REMOVED_MARKER),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        )?;
        Ok(())
    }

    /// Delete the block data of `height` from disk.
    pub fn remove_all(&self, height: Height) -> Result<(), BlockDataError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let path = self.height_path(height);
        if !path.is_dir() {
            return Err(BlockDataError::NotFound(format!("block data, height={}", height)));
        }
        fs::remove_dir_all(path)?;
        Ok(())
    }

    /// Delete everything under the root. With `remove_root` the root directory itself goes too.
    pub fn clean(&self, remove_root: bool) -> Result<(), BlockDataError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        if remove_root {
            fs::remove_dir_all(&self.root)?;
            return Ok(());
        }

        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Path of the file holding `data_type` at `height`.
    pub fn data_path(&self, height: Height, data_type: DataType) -> Result<PathBuf, BlockDataError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_saved(height) {
            return Err(BlockDataError::NotFound(format!("block data, height={}", height)));
        }

        for entry in fs::read_dir(self.height_path(height))? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if let Ok((found_height, found_type, _)) = parse_data_file_name(name) {
                if found_height == height && found_type == data_type {
                    return Ok(path);
                }
            }
        }

        Err(BlockDataError::NotFound(format!(
            "block data file, height={} type={}",
            height, data_type
        )))
    }

    /// Decompressed reader over the file holding `data_type` at `height`.
    pub fn open_data(
        &self,
        height: Height,
        data_type: DataType,
    ) -> Result<BufReader<GzDecoder<File>>, BlockDataError> {
        let path = self.data_path(height, data_type)?;
        Ok(BufReader::new(GzDecoder::new(File::open(path)?)))
    }

    fn load_item<T: DeserializeOwned>(&self, height: Height, data_type: DataType) -> Result<T, BlockDataError> {
        self.writer.read_item(self.open_data(height, data_type)?)
    }

    pub fn load_manifest(&self, height: Height) -> Result<Manifest, BlockDataError> {
        self.load_item(height, DataType::Manifest)
    }

    pub fn load_operations(
        &self,
        height: Height,
        decoders: &OperationDecoders,
    ) -> Result<Vec<Arc<dyn Operation>>, BlockDataError> {
        self.writer
            .read_operations(self.open_data(height, DataType::Operations)?, decoders)
    }

    pub fn load_tree(&self, height: Height, data_type: DataType) -> Result<FixedTree, BlockDataError> {
        if !matches!(data_type, DataType::OperationsTree | DataType::StatesTree) {
            return Err(BlockDataError::InvalidInput(format!("not tree data type, {}", data_type)));
        }
        self.writer.read_tree(self.open_data(height, data_type)?)
    }

    pub fn load_states(&self, height: Height) -> Result<Vec<State>, BlockDataError> {
        self.writer.read_states(self.open_data(height, DataType::States)?)
    }

    /// The map written when `height` was saved.
    pub fn load_map(&self, height: Height) -> Result<BlockDataMap, BlockDataError> {
        let bytes = {
            let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
            if !self.is_saved(height) {
                return Err(BlockDataError::NotFound(format!("block data, height={}", height)));
            }
            fs::read(self.height_path(height).join(MAP_FILE_NAME))?
        };

        let map = BlockDataMap::from_json(&bytes)?;
        map.is_valid()?;
        if map.height() != height {
            return Err(BlockDataError::InvalidInput(format!(
                "map height does not match; expected={} map={}",
                height,
                map.height()
            )));
        }
        Ok(map)
    }

    /// Read back every artifact of `height`, check that they form a valid block, and return it with its
    /// map.
    pub fn load_block(
        &self,
        height: Height,
        decoders: &OperationDecoders,
    ) -> Result<(Block, BlockDataMap), BlockDataError> {
        let map = self.load_map(height)?;

        let block = Block {
            manifest: self.load_manifest(height)?,
            consensus_info: ConsensusInfo {
                init_voteproof: self.load_item::<Voteproof>(height, DataType::InitVoteproof)?,
                accept_voteproof: Some(self.load_item::<Voteproof>(height, DataType::AcceptVoteproof)?),
                suffrage_info: self.load_item::<SuffrageInfo>(height, DataType::SuffrageInfo)?,
                proposal: self.load_item::<Proposal>(height, DataType::Proposal)?,
            },
            operations: self.load_operations(height, decoders)?,
            operations_tree: self.load_tree(height, DataType::OperationsTree)?,
            states: self.load_states(height)?,
            states_tree: self.load_tree(height, DataType::StatesTree)?,
        };

        block.is_valid().map_err(BlockDataError::InvalidInput)?;
        if map.block() != Some(block.hash()) {
            return Err(BlockDataError::InvalidInput(format!(
                "map does not point to loaded block, {}",
                block.hash()
            )));
        }
        Ok((block, map))
    }
}
