/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::CollectiveError;
use crate::CollectiveKind;
use crate::DataType;
use crate::RawCollectiveError;
use crate::UniqueId;

/// The transport that ranks of a group meet on.
///
/// A group is named by the [`UniqueId`] its root generated; every rank that
/// joins with the same id and world size becomes a member. Groups are kept
/// only as long as one of their communicators is alive.
#[derive(Debug, Default)]
pub struct Fabric {
    groups: Mutex<HashMap<UniqueId, Weak<Group>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh token naming a new group. Only the root rank calls this.
    pub fn generate_unique_id(&self) -> UniqueId {
        UniqueId::random()
    }

    pub(crate) fn group(
        &self,
        unique_id: &UniqueId,
        world_size: usize,
    ) -> Result<Arc<Group>, CollectiveError> {
        let mut groups = self.groups.lock();
        groups.retain(|_, group| group.strong_count() > 0);
        if let Some(group) = groups.get(unique_id).and_then(Weak::upgrade) {
            if group.world_size != world_size {
                return Err(RawCollectiveError::InvalidArgument(format!(
                    "group {} has world size {}, but this rank expects {}",
                    unique_id.short(),
                    group.world_size,
                    world_size
                ))
                .into());
            }
            return Ok(group);
        }
        let group = Arc::new(Group::new(unique_id.short(), world_size));
        groups.insert(unique_id.clone(), Arc::downgrade(&group));
        Ok(group)
    }

    /// Number of groups with live members.
    pub fn active_groups(&self) -> usize {
        self.groups
            .lock()
            .values()
            .filter(|group| group.strong_count() > 0)
            .count()
    }
}

/// What a rank issued as a given collective. All ranks must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Signature {
    pub(crate) kind: CollectiveKind,
    pub(crate) count: usize,
    pub(crate) data_type: DataType,
}

#[derive(Debug)]
struct Slot {
    signature: Signature,
    contributions: Vec<Option<Arc<[u8]>>>,
    pending_readers: usize,
}

#[derive(Debug)]
struct GroupState {
    joined: Vec<bool>,
    departed: Vec<bool>,
    failure: Option<RawCollectiveError>,
    slots: HashMap<u64, Slot>,
}

impl GroupState {
    fn joined_count(&self) -> usize {
        self.joined.iter().filter(|joined| **joined).count()
    }
}

/// Shared state of one communicator group.
#[derive(Debug)]
pub(crate) struct Group {
    label: String,
    world_size: usize,
    state: Mutex<GroupState>,
    condvar: Condvar,
}

impl Group {
    fn new(label: String, world_size: usize) -> Self {
        Self {
            label,
            world_size,
            state: Mutex::new(GroupState {
                joined: vec![false; world_size],
                departed: vec![false; world_size],
                failure: None,
                slots: HashMap::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    fn fail(&self, state: &mut GroupState, error: RawCollectiveError) -> RawCollectiveError {
        if state.failure.is_none() {
            tracing::error!("group {} failed: {}", self.label, error);
            state.failure = Some(error.clone());
        }
        self.condvar.notify_all();
        state.failure.clone().unwrap_or(error)
    }

    /// Register `rank` and block until all ranks have joined, the group
    /// fails, or `timeout` elapses. A timeout fails the whole group.
    pub(crate) fn join(&self, rank: usize, timeout: Duration) -> Result<(), RawCollectiveError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.state.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        if state.joined[rank] {
            let error =
                RawCollectiveError::InvalidUsage(format!("rank {rank} joined the group twice"));
            return Err(self.fail(&mut state, error));
        }
        state.joined[rank] = true;
        tracing::debug!(
            "rank {} joined group {} ({}/{})",
            rank,
            self.label,
            state.joined_count(),
            self.world_size
        );
        self.condvar.notify_all();

        loop {
            if state.joined_count() == self.world_size {
                return Ok(());
            }
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            if self.condvar.wait_until(&mut state, deadline).timed_out()
                && state.failure.is_none()
                && state.joined_count() < self.world_size
            {
                let error = RawCollectiveError::Timeout {
                    waited: start.elapsed(),
                    joined: state.joined_count(),
                    world_size: self.world_size,
                };
                return Err(self.fail(&mut state, error));
            }
        }
    }

    /// Deposit this rank's contribution to collective `seq` and block until
    /// every rank has deposited, returning all contributions in rank order.
    pub(crate) fn exchange(
        &self,
        seq: u64,
        rank: usize,
        signature: Signature,
        payload: Vec<u8>,
    ) -> Result<Vec<Arc<[u8]>>, RawCollectiveError> {
        let mut state = self.state.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        let world_size = self.world_size;
        let slot = state.slots.entry(seq).or_insert_with(|| Slot {
            signature,
            contributions: vec![None; world_size],
            pending_readers: world_size,
        });
        if slot.signature != signature {
            let error = RawCollectiveError::InvalidUsage(format!(
                "rank {} issued {} of {} {} elements as collective #{}, but a peer issued {} of {} {} elements",
                rank,
                signature.kind,
                signature.count,
                signature.data_type,
                seq,
                slot.signature.kind,
                slot.signature.count,
                slot.signature.data_type,
            ));
            return Err(self.fail(&mut state, error));
        }
        if slot.contributions[rank].is_some() {
            let error = RawCollectiveError::InternalError(format!(
                "rank {rank} contributed to collective #{seq} twice"
            ));
            return Err(self.fail(&mut state, error));
        }
        slot.contributions[rank] = Some(payload.into());
        self.condvar.notify_all();

        loop {
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            let GroupState {
                departed, slots, ..
            } = &mut *state;
            let outcome = match slots.get_mut(&seq) {
                None => Err(RawCollectiveError::InternalError(format!(
                    "collective #{seq} vanished before rank {rank} read it"
                ))),
                Some(slot) => {
                    let ready: Option<Vec<Arc<[u8]>>> =
                        slot.contributions.iter().cloned().collect();
                    if let Some(contributions) = ready {
                        slot.pending_readers -= 1;
                        if slot.pending_readers == 0 {
                            slots.remove(&seq);
                        }
                        return Ok(contributions);
                    }
                    match slot
                        .contributions
                        .iter()
                        .zip(departed.iter())
                        .position(|(contribution, gone)| contribution.is_none() && *gone)
                    {
                        Some(peer) => Err(RawCollectiveError::RemoteError(format!(
                            "rank {peer} left the group before contributing to collective #{seq}"
                        ))),
                        None => Ok(()),
                    }
                }
            };
            if let Err(error) = outcome {
                return Err(self.fail(&mut state, error));
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Mark `rank` as gone after an orderly shutdown.
    pub(crate) fn leave(&self, rank: usize) {
        let mut state = self.state.lock();
        state.departed[rank] = true;
        self.condvar.notify_all();
    }

    /// Fail the group on behalf of `rank`, waking every waiting peer.
    pub(crate) fn abort(&self, rank: usize, reason: &str) {
        let mut state = self.state.lock();
        state.departed[rank] = true;
        let error = RawCollectiveError::RemoteError(format!("rank {rank} aborted: {reason}"));
        self.fail(&mut state, error);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::ReduceOp;

    fn signature(count: usize) -> Signature {
        Signature {
            kind: CollectiveKind::AllReduce(ReduceOp::Sum),
            count,
            data_type: DataType::Float32,
        }
    }

    #[test]
    fn join_waits_for_all_ranks() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let group = fabric.group(&id, 3).unwrap();
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let group = group.clone();
                thread::spawn(move || group.join(rank, Duration::from_secs(30)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(fabric.active_groups(), 1);
        drop(group);
        assert_eq!(fabric.active_groups(), 0);
    }

    #[test]
    fn join_times_out() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let group = fabric.group(&id, 2).unwrap();
        let err = group.join(0, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(
            err,
            RawCollectiveError::Timeout {
                joined: 1,
                world_size: 2,
                ..
            }
        ));
        // The group is unusable afterwards.
        assert!(group.join(1, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn duplicate_rank_fails_group() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let group = fabric.group(&id, 2).unwrap();
        let first = {
            let group = group.clone();
            thread::spawn(move || group.join(0, Duration::from_secs(30)))
        };
        // Wait until rank 0 is registered before joining as rank 0 again.
        while group.state.lock().joined_count() == 0 {
            thread::yield_now();
        }
        assert!(matches!(
            group.join(0, Duration::from_secs(30)),
            Err(RawCollectiveError::InvalidUsage(_))
        ));
        assert!(first.join().unwrap().is_err());
    }

    #[test]
    fn world_size_must_match() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let _group = fabric.group(&id, 2).unwrap();
        assert!(matches!(
            fabric.group(&id, 3),
            Err(CollectiveError::Raw(RawCollectiveError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn exchange_returns_contributions_in_rank_order() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let group = fabric.group(&id, 2).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let group = group.clone();
                thread::spawn(move || {
                    group
                        .exchange(0, rank, signature(1), vec![rank as u8])
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            let contributions = handle.join().unwrap();
            assert_eq!(&*contributions[0], &[0u8]);
            assert_eq!(&*contributions[1], &[1u8]);
        }
        assert!(group.state.lock().slots.is_empty());
    }

    #[test]
    fn mismatched_signature_fails_group() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let group = fabric.group(&id, 2).unwrap();
        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.exchange(0, 0, signature(4), vec![0; 16]))
        };
        while group.state.lock().slots.is_empty() {
            thread::yield_now();
        }
        assert!(matches!(
            group.exchange(0, 1, signature(8), vec![0; 32]),
            Err(RawCollectiveError::InvalidUsage(_))
        ));
        assert!(matches!(
            waiter.join().unwrap(),
            Err(RawCollectiveError::InvalidUsage(_))
        ));
    }

    #[test]
    fn departed_peer_fails_pending_exchange() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let group = fabric.group(&id, 2).unwrap();
        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.exchange(0, 0, signature(1), vec![0; 4]))
        };
        while group.state.lock().slots.is_empty() {
            thread::yield_now();
        }
        group.leave(1);
        assert!(matches!(
            waiter.join().unwrap(),
            Err(RawCollectiveError::RemoteError(_))
        ));
    }

    #[test]
    fn abort_wakes_waiters() {
        let fabric = Fabric::new();
        let id = fabric.generate_unique_id();
        let group = fabric.group(&id, 3).unwrap();
        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.join(0, Duration::from_secs(30)))
        };
        while group.state.lock().joined_count() == 0 {
            thread::yield_now();
        }
        group.abort(2, "bootstrap failed");
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(
            err,
            RawCollectiveError::RemoteError("rank 2 aborted: bootstrap failed".to_string())
        );
    }
}
