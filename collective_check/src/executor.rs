/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use accel::Event;
use accel::Stream;
use collectives::CollectiveKind;
use collectives::Communicator;
use collectives::DataType;

use crate::HarnessError;
use crate::buffers::OpBuffers;

/// Issues collectives for one participant on its single stream.
///
/// Submission only enqueues; results are observable once the returned
/// [`Event`] has completed or the stream has been drained.
#[derive(Debug)]
pub struct Executor {
    rank: usize,
    comm: Communicator,
    stream: Stream,
}

impl Executor {
    pub fn new(comm: Communicator, stream: Stream) -> Self {
        Self {
            rank: comm.rank(),
            comm,
            stream,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Enqueue `kind` over `buffers`, `count` elements per rank, and return a
    /// handle that completes when it has run.
    pub fn submit(
        &mut self,
        kind: CollectiveKind,
        buffers: &OpBuffers,
        count: usize,
        data_type: DataType,
    ) -> Result<Event, HarnessError> {
        let (input, output) = (buffers.input(), buffers.output());
        let submitted = match kind {
            CollectiveKind::AllReduce(op) => {
                self.comm
                    .all_reduce(input, output, count, data_type, op, &self.stream)
            }
            CollectiveKind::AllGather => {
                self.comm
                    .all_gather(input, output, count, data_type, &self.stream)
            }
            CollectiveKind::Broadcast { root } => {
                self.comm
                    .broadcast(input, output, count, data_type, root, &self.stream)
            }
        };
        submitted.map_err(|source| HarnessError::Collective {
            rank: self.rank,
            call: kind.to_string(),
            source,
        })?;
        self.stream
            .record_event()
            .map_err(|source| HarnessError::Device {
                rank: self.rank,
                call: format!("record_event after {kind}"),
                source,
            })
    }

    /// Block until everything queued on the stream has run.
    pub fn drain(&self) -> Result<(), HarnessError> {
        self.stream
            .synchronize()
            .map_err(|source| HarnessError::Device {
                rank: self.rank,
                call: "stream synchronize".to_string(),
                source,
            })
    }

    /// Drain the stream and leave the group.
    pub fn finish(self) -> Result<(), HarnessError> {
        self.drain()?;
        self.comm.destroy();
        Ok(())
    }

    /// Abandon the group so that peers waiting on this rank fail instead of
    /// hanging.
    pub fn abort(self, reason: &str) {
        tracing::error!("rank {} aborting communicator: {}", self.rank, reason);
        self.comm.abort(reason);
    }
}
