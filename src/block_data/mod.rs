/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block data: the artifacts that make up a block, stored as content-addressed files.
//!
//! A block is persisted as nine files, one per [`DataType`]. Each file is a gzip-compressed stream of
//! JSON lines (see [`writer`]) named `<height>-<data type>-<checksum>.jsonld.gz`, where the checksum is the
//! hex SHA-256 of the compressed file. The files of one height live in a directory named after the
//! zero-padded height:
//!
//! ```text
//! <root>/000000000000000000033/33-manifest-9f86d0....jsonld.gz
//! <root>/000000000000000000033/33-operations-2c26b4....jsonld.gz
//! ...
//! <root>/000000000000000000033/map.json
//! ```
//!
//! A [`BlockDataMap`](map::BlockDataMap) lists the nine files with their checksums and URLs, and its hash
//! seals the block data. Files are written through a [`Session`](session::Session) into a scratch
//! directory first and moved into place by [`LocalBlockData::save_session`](local_fs::LocalBlockData::save_session).

pub mod local_fs;

pub mod map;

pub mod session;

pub mod writer;

use std::{
    fmt::{self, Display, Formatter},
    io,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{
    fixed_tree::TreeError,
    types::{basic::Height, operation::OperationError},
};

pub use local_fs::LocalBlockData;
pub use map::{BlockDataMap, BlockDataMapItem};
pub use session::Session;
pub use writer::BlockDataWriter;

/// Suffix of every block data file.
pub const DATA_FILE_EXTENSION: &str = ".jsonld.gz";

/// Name of the soft-delete marker inside a height directory.
pub const REMOVED_MARKER: &str = ".removed";

/// Name of the JSON block data map inside a height directory.
pub const MAP_FILE_NAME: &str = "map.json";

/// The nine artifacts of a block, in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Manifest,
    Operations,
    OperationsTree,
    States,
    StatesTree,
    InitVoteproof,
    AcceptVoteproof,
    SuffrageInfo,
    Proposal,
}

impl DataType {
    pub const ALL: [DataType; 9] = [
        DataType::Manifest,
        DataType::Operations,
        DataType::OperationsTree,
        DataType::States,
        DataType::StatesTree,
        DataType::InitVoteproof,
        DataType::AcceptVoteproof,
        DataType::SuffrageInfo,
        DataType::Proposal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Manifest => "manifest",
            DataType::Operations => "operations",
            DataType::OperationsTree => "operations_tree",
            DataType::States => "states",
            DataType::StatesTree => "states_tree",
            DataType::InitVoteproof => "init_voteproof",
            DataType::AcceptVoteproof => "accept_voteproof",
            DataType::SuffrageInfo => "suffrage_info",
            DataType::Proposal => "proposal",
        }
    }

    /// Whether the artifact is a list written through `add_*` and `close_*`.
    pub fn is_list(&self) -> bool {
        matches!(self, DataType::Operations | DataType::States)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = BlockDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|data_type| data_type.as_str() == s)
            .ok_or_else(|| BlockDataError::InvalidInput(format!("unknown data type, {:?}", s)))
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Directory name of a height: the height zero-padded to 21 characters, with a leading `-` replaced by
/// `_`.
pub fn height_directory(height: Height) -> String {
    let height = height.int().to_string().replace('-', "_");
    format!("{:0>21}", height)
}

/// File name of a block data file.
pub fn data_file_name(height: Height, data_type: DataType, checksum: &str) -> String {
    format!("{}-{}-{}{}", height, data_type, checksum, DATA_FILE_EXTENSION)
}

/// Inverse of [`data_file_name`].
pub fn parse_data_file_name(name: &str) -> Result<(Height, DataType, String), BlockDataError> {
    let invalid = || BlockDataError::InvalidInput(format!("invalid data file name, {:?}", name));

    let stem = name.strip_suffix(DATA_FILE_EXTENSION).ok_or_else(invalid)?;
    let mut parts = stem.rsplitn(3, '-');
    let checksum = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let data_type = parts.next().ok_or_else(invalid)?.parse()?;
    let height = parts
        .next()
        .and_then(|height| height.parse::<i64>().ok())
        .ok_or_else(invalid)?;

    Ok((Height::new(height), data_type, checksum.to_string()))
}

#[derive(Debug, Error)]
pub enum BlockDataError {
    #[error("not found; {0}")]
    NotFound(String),
    #[error("invalid input; {0}")]
    InvalidInput(String),
    #[error("filesystem error; {0}")]
    Fs(#[from] io::Error),
    #[error("failed to encode block data; {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}
