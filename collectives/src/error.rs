/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::time::Duration;

use accel::AccelError;
use accel::DeviceIndex;
use thiserror::Error;

use crate::DataType;

/// Errors reported by the group transport. These are shared between all
/// ranks of a failed group, hence `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RawCollectiveError {
    #[error("an internal check failed: {0}")]
    InternalError(String),

    #[error("an argument has an invalid value: {0}")]
    InvalidArgument(String),

    #[error("a call to the collective library is incorrect: {0}")]
    InvalidUsage(String),

    #[error("a call failed because a remote rank failed or exited: {0}")]
    RemoteError(String),

    #[error("timed out after {waited:?}: {joined} of {world_size} ranks joined")]
    Timeout {
        waited: Duration,
        joined: usize,
        world_size: usize,
    },
}

/// Types of errors that the safe [`crate::Communicator`] API can return.
#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("a collective-level error: {0}")]
    Raw(#[from] RawCollectiveError),

    #[error("an accelerator-level error: {0}")]
    Accel(#[from] AccelError),

    #[error("world size must be at least 1, got: {0}")]
    InvalidWorldSize(usize),

    #[error("rank {rank} is outside of a world of size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("root rank {root} is outside of a world of size {world_size}")]
    InvalidRoot { root: usize, world_size: usize },

    #[error("unique id must be {expected} bytes, got: {actual}")]
    InvalidUniqueId { expected: usize, actual: usize },

    #[error("communicator is bound to {expected}, got a buffer or stream on {actual}")]
    InvalidDevice {
        expected: DeviceIndex,
        actual: DeviceIndex,
    },

    #[error("input buffer must hold at least {required} bytes, got: {actual}")]
    InputSizeMismatch { required: usize, actual: usize },

    #[error("output buffer must hold at least {required} bytes, got: {actual}")]
    OutputSizeMismatch { required: usize, actual: usize },

    #[error("{count} elements of {data_type:?} times {multiplier} overflow the buffer size")]
    CountOverflow {
        count: usize,
        data_type: DataType,
        multiplier: usize,
    },
}
