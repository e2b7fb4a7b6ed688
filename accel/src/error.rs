/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use thiserror::Error;

use crate::DeviceIndex;

/// An error raised by work running on a [`crate::Stream`]. Work submitted by
/// other libraries (for example a collective) reports its own error type
/// through this boxed form.
pub type StreamFault = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by the accelerator runtime.
#[derive(Debug, Error)]
pub enum AccelError {
    #[error("no accelerator devices were detected")]
    NoDevice,

    #[error("the device ordinal {0} does not correspond to a valid device")]
    InvalidDevice(DeviceIndex),

    #[error("allocation of {requested} bytes on {device} failed: {available} bytes available")]
    MemoryAllocation {
        device: DeviceIndex,
        requested: usize,
        available: usize,
    },

    #[error("buffer belongs to {buffer}, but the operation was issued on {device}")]
    DeviceMismatch {
        device: DeviceIndex,
        buffer: DeviceIndex,
    },

    #[error("copy of {len} bytes does not fit in a buffer of {capacity} bytes")]
    InvalidCopy { len: usize, capacity: usize },

    #[error("the stream on {0} has shut down")]
    StreamClosed(DeviceIndex),

    #[error("failed to spawn the worker thread for a stream on {device}: {source}")]
    StreamCreation {
        device: DeviceIndex,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed on {device}: {message}")]
    LaunchFailure {
        device: DeviceIndex,
        op: String,
        message: String,
    },

    #[error("a previous operation ({op}) on the stream failed: {message}")]
    PriorLaunchFailure { op: String, message: String },

    #[error("{count} elements of {element_size} bytes do not fit in an allocation")]
    SizeOverflow { count: usize, element_size: usize },
}
