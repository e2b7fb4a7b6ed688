/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::Arc;
use std::time::Duration;

use accel::Device;
use accel::DeviceBuffer;
use accel::DeviceIndex;
use accel::Stream;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::CollectiveError;
use crate::CollectiveKind;
use crate::DataType;
use crate::Fabric;
use crate::ReduceOp;
use crate::UniqueId;
use crate::fabric::Group;
use crate::fabric::Signature;
use crate::reduce::reduce;

/// Count of collectives enqueued by a communicator that have not finished
/// running on their stream.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl InFlight {
    fn start(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard {
            inflight: self.clone(),
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.condvar.wait(&mut count);
        }
    }
}

/// Dropped when the queued work finishes, fails, or is skipped by a faulted
/// stream.
struct InFlightGuard {
    inflight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        *self.inflight.count.lock() -= 1;
        self.inflight.condvar.notify_all();
    }
}

/// One rank's membership in a communicator group.
///
/// Collectives are issued in the same order on every rank; each call is
/// matched with the calls other ranks issued at the same position, and a
/// disagreement about kind, count or element type fails the whole group.
#[derive(Debug)]
pub struct Communicator {
    group: Arc<Group>,
    world_size: usize,
    rank: usize,
    device: DeviceIndex,
    next_seq: u64,
    inflight: Arc<InFlight>,
    finished: bool,
}

impl Communicator {
    /// Join the group named by `unique_id` as `rank`, bound to `device`.
    ///
    /// Blocks until all `world_size` ranks have joined. If they have not
    /// arrived within `timeout`, the group fails and every waiting rank
    /// returns an error.
    pub fn new(
        fabric: &Fabric,
        device: &Device,
        world_size: usize,
        unique_id: &UniqueId,
        rank: usize,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        if world_size == 0 {
            return Err(CollectiveError::InvalidWorldSize(world_size));
        }
        if rank >= world_size {
            return Err(CollectiveError::InvalidRank { rank, world_size });
        }
        let group = fabric.group(unique_id, world_size)?;
        group.join(rank, timeout)?;
        tracing::info!(
            "rank {} joined communicator {} of {} ranks on {}",
            rank,
            group.label(),
            world_size,
            device.index()
        );
        Ok(Self {
            group,
            world_size,
            rank,
            device: device.index(),
            next_seq: 0,
            inflight: Arc::new(InFlight::default()),
            finished: false,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Reduce `count` elements of `input` across all ranks with `op`,
    /// writing the result to `output` on every rank. `input` and `output`
    /// may be the same buffer.
    pub fn all_reduce(
        &mut self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        count: usize,
        data_type: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<(), CollectiveError> {
        let nbytes = byte_len(count, data_type, 1)?;
        self.check_placement(&[input, output], stream)?;
        check_input(input, nbytes)?;
        check_output(output, nbytes)?;
        let signature = Signature {
            kind: CollectiveKind::AllReduce(op),
            count,
            data_type,
        };
        self.launch(signature, Some((input, nbytes)), output, stream, move |contributions, out| {
            out[..nbytes].copy_from_slice(&reduce(data_type, op, contributions, count));
        })
    }

    /// Gather `count` elements from every rank's `input` into `output`,
    /// which receives the segments in rank order and must hold
    /// `count * world_size` elements.
    pub fn all_gather(
        &mut self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        count: usize,
        data_type: DataType,
        stream: &Stream,
    ) -> Result<(), CollectiveError> {
        let nbytes = byte_len(count, data_type, 1)?;
        let gathered = byte_len(count, data_type, self.world_size)?;
        self.check_placement(&[input, output], stream)?;
        check_input(input, nbytes)?;
        check_output(output, gathered)?;
        let signature = Signature {
            kind: CollectiveKind::AllGather,
            count,
            data_type,
        };
        self.launch(signature, Some((input, nbytes)), output, stream, move |contributions, out| {
            for (segment, contribution) in out.chunks_exact_mut(nbytes.max(1)).zip(contributions) {
                segment[..contribution.len()].copy_from_slice(contribution);
            }
        })
    }

    /// Copy `count` elements of `input` on rank `root` into `output` on
    /// every rank. `input` is only read on the root.
    pub fn broadcast(
        &mut self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        count: usize,
        data_type: DataType,
        root: usize,
        stream: &Stream,
    ) -> Result<(), CollectiveError> {
        if root >= self.world_size {
            return Err(CollectiveError::InvalidRoot {
                root,
                world_size: self.world_size,
            });
        }
        let nbytes = byte_len(count, data_type, 1)?;
        self.check_placement(&[input, output], stream)?;
        let source = if self.rank == root {
            check_input(input, nbytes)?;
            Some((input, nbytes))
        } else {
            None
        };
        check_output(output, nbytes)?;
        let signature = Signature {
            kind: CollectiveKind::Broadcast { root },
            count,
            data_type,
        };
        self.launch(signature, source, output, stream, move |contributions, out| {
            out[..nbytes].copy_from_slice(&contributions[root]);
        })
    }

    /// Enqueue one collective on `stream`. When it runs, the work reads
    /// this rank's contribution from `input`, exchanges it with the group,
    /// and lets `finish` write the result into `output`.
    fn launch<F>(
        &mut self,
        signature: Signature,
        input: Option<(&DeviceBuffer, usize)>,
        output: &DeviceBuffer,
        stream: &Stream,
        finish: F,
    ) -> Result<(), CollectiveError>
    where
        F: FnOnce(&[Arc<[u8]>], &mut [u8]) + Send + 'static,
    {
        let seq = self.next_seq;
        let rank = self.rank;
        let group = self.group.clone();
        let input = input.map(|(buffer, nbytes)| (buffer.clone(), nbytes));
        let output = output.clone();
        let guard = self.inflight.start();
        tracing::debug!(
            "rank {} enqueuing {} of {} {} elements as collective #{}",
            rank,
            signature.kind,
            signature.count,
            signature.data_type,
            seq
        );
        stream.enqueue(signature.kind.to_string(), move || {
            let _guard = guard;
            let payload = match &input {
                Some((buffer, nbytes)) => buffer.read_on_device(|bytes| bytes[..*nbytes].to_vec()),
                None => Vec::new(),
            };
            let contributions = group.exchange(seq, rank, signature, payload)?;
            output.write_on_device(|out| finish(&contributions, out));
            Ok(())
        })?;
        self.next_seq += 1;
        Ok(())
    }

    fn check_placement(
        &self,
        buffers: &[&DeviceBuffer],
        stream: &Stream,
    ) -> Result<(), CollectiveError> {
        let placements = buffers
            .iter()
            .map(|buffer| buffer.device())
            .chain(std::iter::once(stream.device()));
        for actual in placements {
            if actual != self.device {
                return Err(CollectiveError::InvalidDevice {
                    expected: self.device,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Wait for this rank's outstanding collectives to finish running, then
    /// leave the group.
    pub fn destroy(mut self) {
        self.inflight.wait_idle();
        self.group.leave(self.rank);
        self.finished = true;
        tracing::debug!("rank {} left communicator {}", self.rank, self.group.label());
    }

    /// Fail the group without waiting for outstanding work. Peers blocked in
    /// a collective or in the rendezvous return an error.
    pub fn abort(mut self, reason: &str) {
        self.group.abort(self.rank, reason);
        self.finished = true;
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if !self.finished {
            self.group
                .abort(self.rank, "communicator dropped without being destroyed");
        }
    }
}

/// Bytes in `multiplier` runs of `count` elements of `data_type`.
fn byte_len(
    count: usize,
    data_type: DataType,
    multiplier: usize,
) -> Result<usize, CollectiveError> {
    count
        .checked_mul(data_type.size())
        .and_then(|nbytes| nbytes.checked_mul(multiplier))
        .ok_or(CollectiveError::CountOverflow {
            count,
            data_type,
            multiplier,
        })
}

fn check_input(buffer: &DeviceBuffer, required: usize) -> Result<(), CollectiveError> {
    if buffer.nbytes() < required {
        return Err(CollectiveError::InputSizeMismatch {
            required,
            actual: buffer.nbytes(),
        });
    }
    Ok(())
}

fn check_output(buffer: &DeviceBuffer, required: usize) -> Result<(), CollectiveError> {
    if buffer.nbytes() < required {
        return Err(CollectiveError::OutputSizeMismatch {
            required,
            actual: buffer.nbytes(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use accel::AccelError;
    use accel::Runtime;

    use super::*;
    use crate::RawCollectiveError;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn encode(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn decode(device: &Device, buffer: &DeviceBuffer) -> Vec<f32> {
        let mut host = vec![0u8; buffer.nbytes()];
        device.copy_device_to_host(&mut host, buffer).unwrap();
        host.chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    /// Run `body` once per rank on its own thread, each with its own device
    /// and a communicator for a shared group.
    fn run_ranks<F, R>(world_size: usize, body: F) -> Vec<R>
    where
        F: Fn(usize, &Device, &mut Communicator) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let runtime = Runtime::new(world_size);
        let fabric = Arc::new(Fabric::new());
        let unique_id = fabric.generate_unique_id();
        let body = Arc::new(body);
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let device = runtime.select_device(DeviceIndex(rank)).unwrap();
                let fabric = fabric.clone();
                let unique_id = unique_id.clone();
                let body = body.clone();
                thread::spawn(move || {
                    let mut comm =
                        Communicator::new(&fabric, &device, world_size, &unique_id, rank, TIMEOUT)
                            .unwrap();
                    let result = body(rank, &device, &mut comm);
                    comm.destroy();
                    result
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_reduce() {
        let results = run_ranks(3, |rank, device, comm| {
            let stream = device.create_stream().unwrap();
            let buffer = device.allocate(8).unwrap();
            device
                .copy_host_to_device(&buffer, &encode(&[rank as f32, 1.0]))
                .unwrap();
            comm.all_reduce(&buffer, &buffer, 2, DataType::Float32, ReduceOp::Sum, &stream)
                .unwrap();
            stream.synchronize().unwrap();
            decode(device, &buffer)
        });
        for result in results {
            assert_eq!(result, vec![3.0, 3.0]);
        }
    }

    #[test]
    fn all_gather() {
        let results = run_ranks(2, |rank, device, comm| {
            let stream = device.create_stream().unwrap();
            let input = device.allocate(8).unwrap();
            let output = device.allocate(16).unwrap();
            device
                .copy_host_to_device(&input, &encode(&[rank as f32, 10.0 + rank as f32]))
                .unwrap();
            comm.all_gather(&input, &output, 2, DataType::Float32, &stream)
                .unwrap();
            stream.synchronize().unwrap();
            decode(device, &output)
        });
        for result in results {
            assert_eq!(result, vec![0.0, 10.0, 1.0, 11.0]);
        }
    }

    #[test]
    fn broadcast() {
        let results = run_ranks(3, |rank, device, comm| {
            let stream = device.create_stream().unwrap();
            let buffer = device.allocate(4).unwrap();
            if rank == 1 {
                device
                    .copy_host_to_device(&buffer, &encode(&[42.0]))
                    .unwrap();
            }
            comm.broadcast(&buffer, &buffer, 1, DataType::Float32, 1, &stream)
                .unwrap();
            stream.synchronize().unwrap();
            decode(device, &buffer)
        });
        for result in results {
            assert_eq!(result, vec![42.0]);
        }
    }

    #[test]
    fn collectives_match_in_issue_order() {
        let results = run_ranks(2, |rank, device, comm| {
            let stream = device.create_stream().unwrap();
            let a = device.allocate(4).unwrap();
            let b = device.allocate(4).unwrap();
            device.copy_host_to_device(&a, &encode(&[1.0])).unwrap();
            device
                .copy_host_to_device(&b, &encode(&[rank as f32 + 5.0]))
                .unwrap();
            comm.all_reduce(&a, &a, 1, DataType::Float32, ReduceOp::Sum, &stream)
                .unwrap();
            comm.all_reduce(&b, &b, 1, DataType::Float32, ReduceOp::Max, &stream)
                .unwrap();
            stream.synchronize().unwrap();
            (decode(device, &a), decode(device, &b))
        });
        for (a, b) in results {
            assert_eq!(a, vec![2.0]);
            assert_eq!(b, vec![6.0]);
        }
    }

    #[test]
    fn zero_count_leaves_output_untouched() {
        let results = run_ranks(2, |_, device, comm| {
            let stream = device.create_stream().unwrap();
            let input = device.allocate(0).unwrap();
            let output = device.allocate(0).unwrap();
            comm.all_reduce(&input, &output, 0, DataType::Float32, ReduceOp::Sum, &stream)
                .unwrap();
            comm.all_gather(&input, &output, 0, DataType::Float32, &stream)
                .unwrap();
            comm.broadcast(&input, &output, 0, DataType::Float32, 0, &stream)
                .unwrap();
            stream.synchronize()
        });
        for result in results {
            result.unwrap();
        }
    }

    #[test]
    fn argument_validation() {
        let runtime = Runtime::new(2);
        let fabric = Fabric::new();
        let unique_id = fabric.generate_unique_id();
        let device = runtime.select_device(DeviceIndex(0)).unwrap();
        let other = runtime.select_device(DeviceIndex(1)).unwrap();

        assert!(matches!(
            Communicator::new(&fabric, &device, 0, &unique_id, 0, TIMEOUT),
            Err(CollectiveError::InvalidWorldSize(0))
        ));
        assert!(matches!(
            Communicator::new(&fabric, &device, 1, &unique_id, 1, TIMEOUT),
            Err(CollectiveError::InvalidRank {
                rank: 1,
                world_size: 1
            })
        ));

        let mut comm = Communicator::new(&fabric, &device, 1, &unique_id, 0, TIMEOUT).unwrap();
        let stream = device.create_stream().unwrap();
        let small = device.allocate(4).unwrap();
        let large = device.allocate(16).unwrap();
        let foreign = other.allocate(16).unwrap();

        assert!(matches!(
            comm.all_reduce(&small, &large, 2, DataType::Float32, ReduceOp::Sum, &stream),
            Err(CollectiveError::InputSizeMismatch {
                required: 8,
                actual: 4
            })
        ));
        assert!(matches!(
            comm.all_reduce(&large, &small, 2, DataType::Float32, ReduceOp::Sum, &stream),
            Err(CollectiveError::OutputSizeMismatch {
                required: 8,
                actual: 4
            })
        ));
        assert!(matches!(
            comm.all_gather(&large, &foreign, 1, DataType::Float32, &stream),
            Err(CollectiveError::InvalidDevice { .. })
        ));
        assert!(matches!(
            comm.broadcast(&large, &large, 1, DataType::Float32, 1, &stream),
            Err(CollectiveError::InvalidRoot {
                root: 1,
                world_size: 1
            })
        ));
        assert!(matches!(
            comm.all_reduce(
                &large,
                &large,
                usize::MAX / 2,
                DataType::Float64,
                ReduceOp::Sum,
                &stream
            ),
            Err(CollectiveError::CountOverflow {
                data_type: DataType::Float64,
                multiplier: 1,
                ..
            })
        ));
        assert!(matches!(
            comm.broadcast(&large, &large, usize::MAX, DataType::Float32, 0, &stream),
            Err(CollectiveError::CountOverflow { .. })
        ));

        // Nothing was enqueued, so a valid call still pairs with sequence 0.
        comm.all_reduce(&large, &large, 4, DataType::Float32, ReduceOp::Sum, &stream)
            .unwrap();
        stream.synchronize().unwrap();
        comm.destroy();
    }

    #[test]
    fn mismatched_collectives_fail_the_group() {
        let results = run_ranks(2, |rank, device, comm| {
            let stream = device.create_stream().unwrap();
            let buffer = device.allocate(16).unwrap();
            if rank == 0 {
                comm.all_reduce(&buffer, &buffer, 4, DataType::Float32, ReduceOp::Sum, &stream)
                    .unwrap();
            } else {
                comm.broadcast(&buffer, &buffer, 4, DataType::Float32, 0, &stream)
                    .unwrap();
            }
            stream.synchronize()
        });
        for result in results {
            assert!(matches!(
                result,
                Err(AccelError::LaunchFailure { ref message, .. })
                    if message.contains("collective library is incorrect")
            ));
        }
    }

    #[test]
    fn aborted_peer_fails_pending_collective() {
        let runtime = Runtime::new(2);
        let fabric = Arc::new(Fabric::new());
        let unique_id = fabric.generate_unique_id();

        let quitter = {
            let device = runtime.select_device(DeviceIndex(1)).unwrap();
            let fabric = fabric.clone();
            let unique_id = unique_id.clone();
            thread::spawn(move || {
                let comm =
                    Communicator::new(&fabric, &device, 2, &unique_id, 1, TIMEOUT).unwrap();
                comm.abort("lost interest");
            })
        };

        let device = runtime.select_device(DeviceIndex(0)).unwrap();
        let mut comm = Communicator::new(&fabric, &device, 2, &unique_id, 0, TIMEOUT).unwrap();
        let stream = device.create_stream().unwrap();
        let buffer = device.allocate(4).unwrap();
        // Enqueueing succeeds or reports the failure, depending on timing.
        if comm
            .all_reduce(&buffer, &buffer, 1, DataType::Float32, ReduceOp::Sum, &stream)
            .is_ok()
        {
            let err = stream.synchronize().unwrap_err();
            assert!(matches!(
                err,
                AccelError::LaunchFailure { ref message, .. }
                    if message.contains("rank 1 aborted")
            ));
        }
        quitter.join().unwrap();
        comm.abort("peer failed");
    }

    #[test]
    fn rendezvous_times_out() {
        let runtime = Runtime::new(2);
        let fabric = Fabric::new();
        let unique_id = fabric.generate_unique_id();
        let device = runtime.select_device(DeviceIndex(0)).unwrap();
        let err = Communicator::new(
            &fabric,
            &device,
            2,
            &unique_id,
            0,
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CollectiveError::Raw(RawCollectiveError::Timeout { joined: 1, .. })
        ));
    }
}
