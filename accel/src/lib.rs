/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A host-emulated accelerator runtime.
//!
//! The API follows the shape of the CUDA runtime: a [`Runtime`] enumerates a
//! fixed pool of devices, [`Runtime::select_device`] binds the caller to one of
//! them and returns an explicit [`Device`] context, and every allocation,
//! copy and [`Stream`] is created through that context. Device memory lives in
//! host memory, and each stream runs its work on a dedicated worker thread so
//! that submission is asynchronous relative to the issuer, exactly like a real
//! device queue.

mod device;
mod error;
mod stream;

use std::fmt;

pub use device::Device;
pub use device::DeviceBuffer;
pub use device::MemoryStats;
pub use device::Runtime;
pub use error::AccelError;
pub use error::StreamFault;
pub use stream::Event;
pub use stream::Stream;

/// Ordinal of a device within a [`Runtime`]'s device pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIndex(pub usize);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

impl From<usize> for DeviceIndex {
    fn from(index: usize) -> Self {
        Self(index)
    }
}
