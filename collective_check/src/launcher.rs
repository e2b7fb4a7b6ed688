/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::Arc;

use accel::Runtime;
use collectives::Fabric;
use futures::future::join_all;

use crate::HarnessConfig;
use crate::HarnessError;
use crate::MismatchPolicy;
use crate::ParticipantSummary;
use crate::process_group::LocalProcessGroup;
use crate::run_participant;

/// Outcome of a whole run, one entry per rank.
#[derive(Debug)]
pub struct RunSummary {
    pub policy: MismatchPolicy,
    pub participants: Vec<Result<ParticipantSummary, HarnessError>>,
}

impl RunSummary {
    /// Errors of the participants that failed, in rank order.
    pub fn failures(&self) -> impl Iterator<Item = &HarnessError> {
        self.participants.iter().filter_map(|p| p.as_ref().err())
    }

    pub fn total_mismatches(&self) -> usize {
        self.participants
            .iter()
            .filter_map(|p| p.as_ref().ok())
            .map(ParticipantSummary::mismatches)
            .sum()
    }

    /// Whether the run should exit with a zero status: no participant hit a
    /// fatal error, and under [`MismatchPolicy::Fail`] no mismatch was
    /// recorded.
    pub fn succeeded(&self) -> bool {
        if self.failures().next().is_some() {
            return false;
        }
        match self.policy {
            MismatchPolicy::Report => true,
            MismatchPolicy::Fail => self.total_mismatches() == 0,
        }
    }
}

/// Run `config.world_size()` participants in this process, each on its own
/// blocking thread, sharing an emulated device pool of
/// `config.device_count()` devices and an in-process fabric.
pub async fn run_local(config: HarnessConfig) -> Result<RunSummary, HarnessError> {
    let runtime = Runtime::new(config.device_count());
    run_local_with(config, runtime).await
}

/// Like [`run_local`], on a caller-provided device pool.
pub async fn run_local_with(
    config: HarnessConfig,
    runtime: Runtime,
) -> Result<RunSummary, HarnessError> {
    config.validate()?;
    tracing::info!(
        "launching {} participants on {} devices",
        config.world_size(),
        runtime.device_count()
    );
    let config = Arc::new(config);
    let runtime = Arc::new(runtime);
    let fabric = Arc::new(Fabric::new());

    let tasks = LocalProcessGroup::create(config.world_size())
        .into_iter()
        .enumerate()
        .map(|(rank, group)| {
            let config = config.clone();
            let runtime = runtime.clone();
            let fabric = fabric.clone();
            let task = tokio::task::spawn_blocking(move || {
                run_participant(&config, &runtime, &fabric, group)
            });
            async move {
                task.await.unwrap_or_else(|err| {
                    Err(HarnessError::Panicked {
                        rank,
                        message: err.to_string(),
                    })
                })
            }
        });
    let participants = join_all(tasks).await;

    let summary = RunSummary {
        policy: config.mismatch_policy(),
        participants,
    };
    for failure in summary.failures() {
        tracing::error!("{}", failure);
    }
    tracing::info!(
        "{} of {} participants completed, {} mismatched elements",
        summary.participants.iter().filter(|p| p.is_ok()).count(),
        summary.participants.len(),
        summary.total_mismatches()
    );
    Ok(summary)
}
