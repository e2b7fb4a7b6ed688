/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runs every participant of a collective correctness check in this process.
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use collective_check::HarnessConfig;
use collective_check::MismatchPolicy;
use collective_check::config::ElementType;
use collective_check::logging::initialize_logging;
use collective_check::run_local;
use collectives::ReduceOp;

#[derive(Debug, Parser)]
#[command(name = "collective_check")]
#[command(about = "Check all-reduce, all-gather and broadcast results across a group")]
struct Args {
    /// YAML file with harness settings. Environment variables and flags
    /// override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of participants.
    #[arg(short = 'n', long)]
    world_size: Option<usize>,

    /// Number of emulated devices; ranks are dealt round-robin over them.
    #[arg(long)]
    device_count: Option<usize>,

    /// Elements per participant for all-reduce and all-gather.
    #[arg(long)]
    element_count: Option<usize>,

    /// Rounds to run on the same communicator.
    #[arg(long)]
    rounds: Option<usize>,

    #[arg(long, value_enum)]
    element_type: Option<ElementType>,

    /// Reduction for all-reduce: sum, prod, max, min or avg.
    #[arg(long)]
    reduce_op: Option<ReduceOp>,

    /// Largest accepted absolute error for all-reduce.
    #[arg(long)]
    tolerance: Option<f64>,

    #[arg(long)]
    broadcast_root: Option<usize>,

    #[arg(long)]
    broadcast_value: Option<f64>,

    #[arg(long)]
    broadcast_count: Option<usize>,

    #[arg(long, value_enum)]
    mismatch_policy: Option<MismatchPolicy>,

    /// Exit non-zero on any mismatch. Same as `--mismatch-policy fail`.
    #[arg(long, conflicts_with = "mismatch_policy")]
    strict: bool,

    /// How long communicator creation waits for all participants.
    #[arg(long)]
    init_timeout_ms: Option<u64>,

    /// Number of all-reduce elements rank 0 prints.
    #[arg(long)]
    report_preview: Option<usize>,

    /// Write the effective configuration to this file before running.
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

impl Args {
    fn layer(&self) -> HarnessConfig {
        HarnessConfig {
            world_size: self.world_size,
            device_count: self.device_count,
            element_count: self.element_count,
            rounds: self.rounds,
            element_type: self.element_type,
            reduce_op: self.reduce_op,
            tolerance: self.tolerance,
            broadcast_root: self.broadcast_root,
            broadcast_value: self.broadcast_value,
            broadcast_count: self.broadcast_count,
            mismatch_policy: if self.strict {
                Some(MismatchPolicy::Fail)
            } else {
                self.mismatch_policy
            },
            init_timeout_ms: self.init_timeout_ms,
            report_preview: self.report_preview,
        }
    }
}

fn load_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::default();
    if let Some(path) = &args.config {
        let file = HarnessConfig::from_yaml(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        config.merge(&file);
    }
    config.merge(&HarnessConfig::from_env());
    config.merge(&args.layer());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    initialize_logging();
    let args = Args::parse();

    let config = load_config(&args)?;
    if let Some(path) = &args.dump_config {
        config
            .to_yaml(path)
            .with_context(|| format!("writing configuration to {}", path.display()))?;
    }

    let summary = run_local(config).await.context("starting participants")?;
    if summary.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        for failure in summary.failures() {
            eprintln!("error: {failure}");
        }
        if summary.total_mismatches() > 0 {
            eprintln!(
                "{} mismatched elements (policy: {:?})",
                summary.total_mismatches(),
                summary.policy
            );
        }
        Ok(ExitCode::FAILURE)
    }
}
