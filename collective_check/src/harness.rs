/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One participant's run: bootstrap, handshake, then rounds of all-reduce,
//! all-gather and broadcast, each verified before its buffers are freed.

use accel::AccelError;
use accel::Device;
use accel::Runtime;
use collectives::CollectiveKind;
use collectives::Fabric;

use crate::HarnessConfig;
use crate::HarnessError;
use crate::buffers::OpBuffers;
use crate::config::ElementType;
use crate::element;
use crate::element::Element;
use crate::executor::Executor;
use crate::handshake;
use crate::process_group::ProcessGroup;
use crate::topology;
use crate::topology::Participant;
use crate::verify;
use crate::verify::Comparison;
use crate::verify::VerificationReport;

/// What a participant that ran to completion reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSummary {
    pub participant: Participant,
    pub rounds: usize,
    /// One report per collective per round, in issue order.
    pub reports: Vec<VerificationReport>,
}

impl ParticipantSummary {
    pub fn rank(&self) -> usize {
        self.participant.rank
    }

    /// Total number of mismatched elements over all rounds.
    pub fn mismatches(&self) -> usize {
        self.reports.iter().map(|r| r.mismatches.len()).sum()
    }
}

/// Run one participant to completion.
///
/// Verification mismatches are counted in the summary and do not stop the
/// run. Any other failure is fatal: it aborts the communicator, so peers
/// blocked on this rank fail too, and is returned as the error.
pub fn run_participant<P: ProcessGroup>(
    config: &HarnessConfig,
    runtime: &Runtime,
    fabric: &Fabric,
    group: P,
) -> Result<ParticipantSummary, HarnessError> {
    let span = tracing::info_span!("participant", rank = group.rank());
    let _guard = span.enter();
    let result = match config.element_type() {
        ElementType::Float32 => run::<f32, P>(config, runtime, fabric, group),
        ElementType::Float64 => run::<f64, P>(config, runtime, fabric, group),
    };
    if let Err(err) = &result {
        tracing::error!("{}", err);
    }
    result
}

fn run<T: Element, P: ProcessGroup>(
    config: &HarnessConfig,
    runtime: &Runtime,
    fabric: &Fabric,
    mut group: P,
) -> Result<ParticipantSummary, HarnessError> {
    let (participant, device) = topology::bootstrap(&group, runtime)?;
    let comm = handshake::establish(&mut group, fabric, &device, config.init_timeout())?;
    let stream = device
        .create_stream()
        .map_err(device_error(participant.rank, "create_stream"))?;
    let mut executor = Executor::new(comm, stream);

    let mut reports = Vec::new();
    for round in 0..config.rounds() {
        let mut context = RoundContext {
            config,
            participant,
            device: &device,
            executor: &mut executor,
            round,
        };
        match context.run::<T>() {
            Ok(round_reports) => reports.extend(round_reports),
            Err(err) => {
                executor.abort(&err.to_string());
                return Err(err);
            }
        }
    }
    executor.finish()?;

    let summary = ParticipantSummary {
        participant,
        rounds: config.rounds(),
        reports,
    };
    if summary.mismatches() > 0 {
        tracing::warn!(
            "Rank {} recorded {} mismatched elements",
            participant.rank,
            summary.mismatches()
        );
    }
    tracing::info!("Rank {} completed successfully", participant.rank);
    Ok(summary)
}

fn device_error(rank: usize, call: impl Into<String>) -> impl FnOnce(AccelError) -> HarnessError {
    let call = call.into();
    move |source| HarnessError::Device { rank, call, source }
}

struct RoundContext<'a> {
    config: &'a HarnessConfig,
    participant: Participant,
    device: &'a Device,
    executor: &'a mut Executor,
    round: usize,
}

impl RoundContext<'_> {
    fn rank(&self) -> usize {
        self.participant.rank
    }

    fn run<T: Element>(&mut self) -> Result<Vec<VerificationReport>, HarnessError> {
        let baseline = self.device.memory_stats().live_allocations;
        let reports = vec![
            self.all_reduce::<T>()?,
            self.all_gather::<T>()?,
            self.broadcast::<T>()?,
        ];
        let live_allocations = self.device.memory_stats().live_allocations;
        if live_allocations != baseline {
            return Err(HarnessError::BufferLeak {
                rank: self.rank(),
                round: self.round,
                live_allocations: live_allocations - baseline,
            });
        }
        tracing::debug!(
            "round {} verified: {} mismatched elements",
            self.round,
            reports.iter().map(|r| r.mismatches.len()).sum::<usize>()
        );
        Ok(reports)
    }

    /// Submit `kind`, wait for its completion handle, drain the stream and
    /// read the output back.
    fn execute<T: Element>(
        &mut self,
        kind: CollectiveKind,
        buffers: &OpBuffers,
        count: usize,
    ) -> Result<Vec<T>, HarnessError> {
        let event = self.executor.submit(kind, buffers, count, T::DATA_TYPE)?;
        event
            .synchronize()
            .map_err(device_error(self.rank(), format!("wait for {kind}")))?;
        self.executor.drain()?;
        buffers
            .read_output(self.device)
            .map_err(device_error(self.rank(), format!("read back {kind}")))
    }

    /// Allocate buffers for `kind`, fill the input and pre-fill the output.
    fn prepare<T: Element>(
        &self,
        kind: CollectiveKind,
        buffers: Result<OpBuffers, AccelError>,
        input: &[T],
    ) -> Result<OpBuffers, HarnessError> {
        let rank = self.rank();
        let buffers = buffers.map_err(device_error(rank, format!("allocate for {kind}")))?;
        buffers
            .prefill_output(self.device, &element::sentinel::<T>(buffers.output_len()))
            .map_err(device_error(rank, format!("prefill for {kind}")))?;
        buffers
            .populate(self.device, input)
            .map_err(device_error(rank, format!("populate for {kind}")))?;
        Ok(buffers)
    }

    fn all_reduce<T: Element>(&mut self) -> Result<VerificationReport, HarnessError> {
        let (rank, world_size) = (self.rank(), self.participant.world_size);
        let count = self.config.element_count();
        let op = self.config.reduce_op();
        let kind = CollectiveKind::AllReduce(op);

        let input = element::reduce_input::<T>(rank, count);
        if self.round == 0 {
            if let Some(first) = input.first() {
                tracing::info!("Rank {} initialized with data starting from {}", rank, first);
            }
        }
        let buffers = self.prepare(
            kind,
            OpBuffers::allocate::<T>(self.device, count, count),
            &input,
        )?;
        let observed = self.execute::<T>(kind, &buffers, count)?;
        let expected = verify::expected_all_reduce::<T>(op, world_size, count);

        if rank == 0 {
            let preview = self.config.report_preview().min(count);
            tracing::info!("AllReduce results (first {} elements):", preview);
            for i in 0..preview {
                tracing::info!("  Element {}: {} (expected: {})", i, observed[i], expected[i]);
            }
        }
        let report = verify::compare(
            rank,
            kind,
            &observed,
            &expected,
            Comparison::Tolerance(self.config.tolerance()),
        );
        buffers.free();
        Ok(report)
    }

    fn all_gather<T: Element>(&mut self) -> Result<VerificationReport, HarnessError> {
        let (rank, world_size) = (self.rank(), self.participant.world_size);
        let count = self.config.element_count();
        let kind = CollectiveKind::AllGather;

        let input = element::gather_input::<T>(rank, count);
        let buffers = self.prepare(
            kind,
            OpBuffers::allocate::<T>(self.device, count, count * world_size),
            &input,
        )?;
        let observed = self.execute::<T>(kind, &buffers, count)?;
        let expected = verify::expected_all_gather::<T>(world_size, count);

        if rank == 0 && count > 0 {
            tracing::info!("AllGather results (first element from each rank):");
            for (r, segment) in observed.chunks(count).enumerate() {
                tracing::info!("  From rank {}: {}", r, segment[0]);
            }
        }
        let report = verify::compare(rank, kind, &observed, &expected, Comparison::Exact);
        buffers.free();
        Ok(report)
    }

    fn broadcast<T: Element>(&mut self) -> Result<VerificationReport, HarnessError> {
        let rank = self.rank();
        let count = self.config.broadcast_count();
        let root = self.config.broadcast_root();
        let value = self.config.broadcast_value();
        let kind = CollectiveKind::Broadcast { root };

        // Non-root ranks start from the sentinel so an undelivered value
        // shows up as a mismatch.
        let input = if rank == root {
            tracing::info!("Broadcasting value {} from rank {}", T::from_f64(value), root);
            element::broadcast_input::<T>(value, count)
        } else {
            element::sentinel::<T>(count)
        };
        let buffers = self.prepare(
            kind,
            OpBuffers::allocate_in_place::<T>(self.device, count),
            &input,
        )?;
        let observed = self.execute::<T>(kind, &buffers, count)?;
        let expected = verify::expected_broadcast::<T>(value, count);

        if let Some(received) = observed.first() {
            tracing::info!("Rank {} received broadcast value: {}", rank, received);
        }
        let report = verify::compare(rank, kind, &observed, &expected, Comparison::Exact);
        buffers.free();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use accel::DeviceIndex;
    use collectives::ReduceOp;
    use tracing_test::traced_test;

    use super::*;
    use crate::process_group::LocalProcessGroup;

    fn config(world_size: usize, element_count: usize) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.world_size = Some(world_size);
        config.element_count = Some(element_count);
        config
    }

    fn run_all(
        config: HarnessConfig,
        runtime: Runtime,
    ) -> Vec<Result<ParticipantSummary, HarnessError>> {
        let config = Arc::new(config);
        let runtime = Arc::new(runtime);
        let fabric = Arc::new(Fabric::new());
        let handles: Vec<_> = LocalProcessGroup::create(config.world_size())
            .into_iter()
            .map(|group| {
                let (config, runtime, fabric) = (config.clone(), runtime.clone(), fabric.clone());
                thread::spawn(move || run_participant(&config, &runtime, &fabric, group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn three_collectives_per_round() {
        let mut config = config(3, 16);
        config.rounds = Some(2);
        for result in run_all(config, Runtime::new(3)) {
            let summary = result.unwrap();
            assert_eq!(summary.rounds, 2);
            assert_eq!(summary.reports.len(), 6);
            assert_eq!(summary.mismatches(), 0);
            assert_eq!(summary.reports[0].kind, CollectiveKind::AllReduce(ReduceOp::Sum));
            assert_eq!(summary.reports[1].kind, CollectiveKind::AllGather);
            assert_eq!(summary.reports[2].kind, CollectiveKind::Broadcast { root: 0 });
            assert_eq!(summary.reports[1].checked, 48);
        }
    }

    #[test]
    fn float64_and_other_reduce_ops() {
        let mut config = config(2, 8);
        config.element_type = Some(ElementType::Float64);
        config.reduce_op = Some(ReduceOp::Avg);
        config.broadcast_root = Some(1);
        config.broadcast_count = Some(3);
        for result in run_all(config, Runtime::new(2)) {
            assert_eq!(result.unwrap().mismatches(), 0);
        }
    }

    #[test]
    fn ranks_share_devices() {
        let results = run_all(config(4, 4), Runtime::new(2));
        let devices: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().participant.device)
            .collect();
        assert_eq!(
            devices,
            vec![DeviceIndex(0), DeviceIndex(1), DeviceIndex(0), DeviceIndex(1)]
        );
    }

    #[test]
    fn out_of_memory_fails_every_rank() {
        // Room for the all-reduce buffers but not for the gather output.
        let runtime = Runtime::with_memory_limit(2, 2 * 64 * 4 + 64);
        for result in run_all(config(2, 64), runtime) {
            assert!(result.is_err());
        }
    }

    #[traced_test]
    #[test]
    fn single_rank_report() {
        let config = config(1, 8);
        let runtime = Runtime::new(1);
        let fabric = Fabric::new();
        let group = LocalProcessGroup::create(1).pop().unwrap();
        let summary = run_participant(&config, &runtime, &fabric, group).unwrap();
        assert_eq!(summary.mismatches(), 0);
        assert!(logs_contain("Process 0 of 1 starting"));
        assert!(logs_contain("Rank 0 using device 0"));
        assert!(logs_contain("AllReduce results (first 5 elements):"));
        assert!(logs_contain("Element 4: 4 (expected: 4)"));
        assert!(logs_contain("From rank 0: 0"));
        assert!(logs_contain("Broadcasting value 42 from rank 0"));
        assert!(logs_contain("Rank 0 received broadcast value: 42"));
        assert!(logs_contain("Rank 0 completed successfully"));
    }
}
