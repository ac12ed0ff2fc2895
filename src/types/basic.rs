/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" newtypes that are passed around and inspected but have no active behavior.

use std::{
    fmt::{self, Display, Formatter},
    ops::Add,
};

use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Height of a block. `-1` is the height "before genesis".
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshDeserialize,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
pub struct Height(i64);

impl Height {
    pub const PRE_GENESIS: Height = Height(-1);

    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<i64> for Height {
    type Output = Height;
    fn add(self, rhs: i64) -> Self::Output {
        Height::new(self.0 + rhs)
    }
}

/// Round number within a height.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshDeserialize,
    BorshSerialize,
    Serialize,
    Deserialize,
)]
pub struct Round(u64);

impl Round {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Voting stage a voteproof was collected for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "INIT")]
    Init,
    #[serde(rename = "ACCEPT")]
    Accept,
}

impl Stage {
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Stage::Init => b"INIT",
            Stage::Accept => b"ACCEPT",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "INIT"),
            Stage::Accept => write!(f, "ACCEPT"),
        }
    }
}

/// Address of a suffrage node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical byte form of a timestamp: its RFC 3339 representation with nanoseconds, in UTC.
pub fn time_bytes(time: &DateTime<Utc>) -> Vec<u8> {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes()
}
