/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::fmt::Write;
use std::str::FromStr;

use rand::RngCore;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeSeq;

use crate::CollectiveError;

/// Element types understood by the collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int8,
    Uint8,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int8 => "int8",
            DataType::Uint8 => "uint8",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Element-wise combination used by reductions.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
    Avg,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
            ReduceOp::Avg => "avg",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an unknown [`ReduceOp`] name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reduce op {0:?}, expected one of: sum, prod, max, min, avg")]
pub struct ParseReduceOpError(String);

impl FromStr for ReduceOp {
    type Err = ParseReduceOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(ReduceOp::Sum),
            "prod" => Ok(ReduceOp::Prod),
            "max" => Ok(ReduceOp::Max),
            "min" => Ok(ReduceOp::Min),
            "avg" => Ok(ReduceOp::Avg),
            _ => Err(ParseReduceOpError(s.to_string())),
        }
    }
}

/// The kind of a collective call, with its kind-specific argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    AllReduce(ReduceOp),
    AllGather,
    Broadcast { root: usize },
}

impl fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveKind::AllReduce(op) => write!(f, "all_reduce({op})"),
            CollectiveKind::AllGather => write!(f, "all_gather"),
            CollectiveKind::Broadcast { root } => write!(f, "broadcast(root={root})"),
        }
    }
}

/// Opaque token naming a new communicator group. Generated once by the root
/// rank and copied byte-for-byte to every other rank.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    #[serde(serialize_with = "serialize_array", deserialize_with = "deserialize_array")]
    internal: [u8; UniqueId::SIZE],
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueId")
            .field("inner", &format_args!("{}", hex(&self.internal)))
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{:02x}", b);
        output
    })
}

impl UniqueId {
    /// Length of the token in bytes.
    pub const SIZE: usize = 128;

    pub(crate) fn random() -> Self {
        let mut internal = [0u8; Self::SIZE];
        rand::thread_rng().fill_bytes(&mut internal);
        Self { internal }
    }

    /// Rebuild a token from the bytes produced by [`UniqueId::as_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CollectiveError> {
        let internal = bytes
            .try_into()
            .map_err(|_| CollectiveError::InvalidUniqueId {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { internal })
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.internal
    }

    /// A short prefix of the token, for logs.
    pub fn short(&self) -> String {
        hex(&self.internal[..4])
    }
}

fn deserialize_array<'de, D>(deserializer: D) -> Result<[u8; UniqueId::SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let vec: Vec<u8> = Deserialize::deserialize(deserializer)?;
    vec.try_into().map_err(|v: Vec<u8>| {
        serde::de::Error::invalid_length(v.len(), &"expected an array of length 128")
    })
}

fn serialize_array<S>(array: &[u8; UniqueId::SIZE], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(UniqueId::SIZE))?;
    for element in array {
        seq.serialize_element(element)?;
    }
    seq.end()
}
