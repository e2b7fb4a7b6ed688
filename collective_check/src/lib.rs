/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A correctness harness for collective communication.
//!
//! Every participant binds to one device, joins a communicator through a
//! root-generated token, and then runs rounds of all-reduce, all-gather and
//! broadcast over freshly allocated device buffers. Each output is checked
//! against values computed on the host from the same deterministic inputs.
//! Mismatches are reported and counted; any error from the runtime or the
//! collective library ends the participant's run.

pub mod buffers;
pub mod config;
pub mod element;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod harness;
pub mod launcher;
pub mod logging;
pub mod process_group;
pub mod topology;
pub mod verify;

pub use config::HarnessConfig;
pub use config::MismatchPolicy;
pub use error::HarnessError;
pub use harness::ParticipantSummary;
pub use harness::run_participant;
pub use launcher::RunSummary;
pub use launcher::run_local;
pub use launcher::run_local_with;
