/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use accel::AccelError;
use collectives::CollectiveError;
use thiserror::Error;

use crate::process_group::ProcessGroupError;

/// Fatal errors that end a participant's run. Each names the rank and the
/// call that failed.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("rank {rank}: bootstrap failed in {call}: {source}")]
    Bootstrap {
        rank: usize,
        call: &'static str,
        #[source]
        source: AccelError,
    },

    #[error("rank {rank}: process group {call} failed: {source}")]
    ProcessGroup {
        rank: usize,
        call: &'static str,
        #[source]
        source: ProcessGroupError,
    },

    #[error("rank {rank}: handshake failed in {call}: {source}")]
    Handshake {
        rank: usize,
        call: &'static str,
        #[source]
        source: CollectiveError,
    },

    #[error("rank {rank}: {call} failed: {source}")]
    Collective {
        rank: usize,
        call: String,
        #[source]
        source: CollectiveError,
    },

    #[error("rank {rank}: {call} failed: {source}")]
    Device {
        rank: usize,
        call: String,
        #[source]
        source: AccelError,
    },

    #[error("rank {rank}: {live_allocations} device buffers were still allocated after round {round}")]
    BufferLeak {
        rank: usize,
        round: usize,
        live_allocations: usize,
    },

    #[error("rank {rank}: participant panicked: {message}")]
    Panicked { rank: usize, message: String },
}

impl HarnessError {
    /// The rank this error was raised on, if it belongs to one.
    pub fn rank(&self) -> Option<usize> {
        match self {
            HarnessError::InvalidConfig(_) => None,
            HarnessError::Bootstrap { rank, .. }
            | HarnessError::ProcessGroup { rank, .. }
            | HarnessError::Handshake { rank, .. }
            | HarnessError::Collective { rank, .. }
            | HarnessError::Device { rank, .. }
            | HarnessError::BufferLeak { rank, .. }
            | HarnessError::Panicked { rank, .. } => Some(*rank),
        }
    }
}
