/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Self-describing type tags.
//!
//! Every record this crate serializes carries a [`Hint`] in its `_hint` field. A hint is a two-byte
//! [`HintType`] plus a [semver](semver::Version) version. Readers route a record to a decoder (or an
//! operation processor) through a [`HintSet`], which picks the registered entry whose hint the record's
//! hint is [compatible](Hint::is_compatible) with.
//!
//! ## Compatibility
//!
//! A hint `check` is compatible with a registered hint `target` iff:
//! 1. Both have the same type.
//! 2. Both have the same major version.
//! 3. `check`'s `(major, minor, patch)` is less than or equal to `target`'s.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use semver::Version;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Two-byte type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HintType([u8; 2]);

impl HintType {
    pub const fn new(bytes: [u8; 2]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 2] {
        self.0
    }
}

impl Display for HintType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for HintType {
    type Err = HintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 2];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| HintError::InvalidType(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for HintType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HintType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A versioned type tag embedded into every persisted structure.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hint {
    #[serde(rename = "type")]
    hint_type: HintType,
    version: Version,
}

impl Hint {
    pub const fn new(hint_type: HintType, major: u64, minor: u64, patch: u64) -> Self {
        Self {
            hint_type,
            version: Version::new(major, minor, patch),
        }
    }

    /// Build a hint from a version string such as `"0.1.2"`.
    pub fn with_version(hint_type: HintType, version: &str) -> Result<Self, HintError> {
        let version = Version::parse(version)?;
        Ok(Self { hint_type, version })
    }

    pub const fn hint_type(&self) -> HintType {
        self.hint_type
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether a record tagged with `self` may be handled by something registered under `target`.
    pub fn is_compatible(&self, target: &Hint) -> bool {
        if self.hint_type != target.hint_type {
            return false;
        }
        if self.version.major != target.version.major {
            return false;
        }

        (self.version.major, self.version.minor, self.version.patch)
            <= (target.version.major, target.version.minor, target.version.patch)
    }

    /// Canonical bytes: the two type bytes followed by the version string.
    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = self.hint_type.bytes().to_vec();
        bytes.extend_from_slice(self.version.to_string().as_bytes());
        bytes
    }
}

impl Display for Hint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}+v{}", self.hint_type, self.version)
    }
}

impl FromStr for Hint {
    type Err = HintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hint_type, version) = s
            .split_once("+v")
            .ok_or_else(|| HintError::InvalidFormat(s.to_string()))?;
        Hint::with_version(hint_type.parse()?, version)
    }
}

/// Registry mapping hints to values (decoders, processor factories, ...).
///
/// Several versions of one type can be registered side by side; lookups return the entry with the
/// highest version the queried hint is compatible with.
pub struct HintSet<T> {
    entries: HashMap<HintType, Vec<(Hint, T)>>,
}

impl<T> HintSet<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, hint: Hint, value: T) -> Result<(), HintError> {
        let versions = self.entries.entry(hint.hint_type()).or_default();
        if versions.iter().any(|(registered, _)| registered == &hint) {
            return Err(HintError::Duplicated(hint));
        }
        versions.push((hint, value));
        versions.sort_by(|(a, _), (b, _)| b.version().cmp(a.version()));
        Ok(())
    }

    pub fn compatible(&self, hint: &Hint) -> Option<&T> {
        self.entries
            .get(&hint.hint_type())?
            .iter()
            .find(|(registered, _)| hint.is_compatible(registered))
            .map(|(_, value)| value)
    }

    /// Like [`compatible`](Self::compatible) but returns the registered hint as well.
    pub fn compatible_entry(&self, hint: &Hint) -> Option<(&Hint, &T)> {
        self.entries
            .get(&hint.hint_type())?
            .iter()
            .find(|(registered, _)| hint.is_compatible(registered))
            .map(|(registered, value)| (registered, value))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for HintSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum HintError {
    #[error("invalid hint type, {0}")]
    InvalidType(String),
    #[error("invalid hint format, {0}")]
    InvalidFormat(String),
    #[error("invalid hint version; {0}")]
    InvalidVersion(#[from] semver::Error),
    #[error("hint already registered, {0}")]
    Duplicated(Hint),
    #[error("hint not found, {0}")]
    NotFound(Hint),
}
