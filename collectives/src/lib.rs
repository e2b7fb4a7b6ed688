/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Collective communication over [`accel`] devices.
//!
//! The API mirrors NCCL: the root rank creates a [`UniqueId`], ships it to
//! its peers out of band, and every rank then calls [`Communicator::new`],
//! which blocks until the whole group has arrived. Collectives are enqueued
//! on a caller-provided [`accel::Stream`] and complete asynchronously.
//!
//! Ranks meet through a [`Fabric`], the transport shared by all members of a
//! group. The fabric in this crate connects ranks living in the same OS
//! process.

mod communicator;
mod error;
mod fabric;
mod reduce;
mod types;

pub use communicator::Communicator;
pub use error::CollectiveError;
pub use error::RawCollectiveError;
pub use fabric::Fabric;
pub use types::CollectiveKind;
pub use types::DataType;
pub use types::ParseReduceOpError;
pub use types::ReduceOp;
pub use types::UniqueId;
