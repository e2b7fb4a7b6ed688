/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Out-of-band process groups used to bootstrap a communicator.
//!
//! The harness needs three things from its launcher: the caller's rank, the
//! size of the group, and a reliable broadcast to ship the communicator token
//! from rank 0 to everybody else. [`LocalProcessGroup`] provides them for
//! participants running as threads of one process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessGroupError {
    #[error("root rank {root} is outside of a world of size {world_size}")]
    InvalidRoot { root: usize, world_size: usize },

    #[error("rank {root} broadcast {sent} bytes into a buffer of {expected} bytes")]
    SizeMismatch {
        root: usize,
        sent: usize,
        expected: usize,
    },

    #[error("expected a broadcast from rank {expected}, got one from rank {actual}")]
    RootMismatch { expected: usize, actual: usize },

    #[error("rank {0} left the process group")]
    PeerExited(usize),
}

/// Rank identity and bootstrap broadcast for one participant.
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replace `buf` on every rank with the contents of `buf` on `root`.
    /// All ranks must call this with the same root and buffer length.
    fn broadcast(&mut self, buf: &mut [u8], root: usize) -> Result<(), ProcessGroupError>;
}

#[derive(Debug)]
struct Message {
    root: usize,
    data: Arc<[u8]>,
    pending_readers: usize,
}

#[derive(Debug)]
struct LocalState {
    messages: HashMap<u64, Message>,
    exited: Vec<bool>,
}

#[derive(Debug)]
struct LocalShared {
    world_size: usize,
    state: Mutex<LocalState>,
    condvar: Condvar,
}

/// A process group whose members are threads of the current process.
#[derive(Debug)]
pub struct LocalProcessGroup {
    rank: usize,
    next_seq: u64,
    shared: Arc<LocalShared>,
}

impl LocalProcessGroup {
    /// Create the handles for every rank of a new group, in rank order.
    pub fn create(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(LocalShared {
            world_size,
            state: Mutex::new(LocalState {
                messages: HashMap::new(),
                exited: vec![false; world_size],
            }),
            condvar: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                next_seq: 0,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn broadcast(&mut self, buf: &mut [u8], root: usize) -> Result<(), ProcessGroupError> {
        let world_size = self.shared.world_size;
        if root >= world_size {
            return Err(ProcessGroupError::InvalidRoot { root, world_size });
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut state = self.shared.state.lock();
        if self.rank == root {
            if world_size > 1 {
                state.messages.insert(
                    seq,
                    Message {
                        root,
                        data: buf.to_vec().into(),
                        pending_readers: world_size - 1,
                    },
                );
                self.shared.condvar.notify_all();
            }
            return Ok(());
        }

        loop {
            if let Some(message) = state.messages.get_mut(&seq) {
                if message.root != root {
                    return Err(ProcessGroupError::RootMismatch {
                        expected: root,
                        actual: message.root,
                    });
                }
                if message.data.len() != buf.len() {
                    return Err(ProcessGroupError::SizeMismatch {
                        root,
                        sent: message.data.len(),
                        expected: buf.len(),
                    });
                }
                buf.copy_from_slice(&message.data);
                message.pending_readers -= 1;
                if message.pending_readers == 0 {
                    state.messages.remove(&seq);
                }
                return Ok(());
            }
            if state.exited[root] {
                return Err(ProcessGroupError::PeerExited(root));
            }
            self.shared.condvar.wait(&mut state);
        }
    }
}

impl Drop for LocalProcessGroup {
    fn drop(&mut self) {
        self.shared.state.lock().exited[self.rank] = true;
        self.shared.condvar.notify_all();
    }
}
