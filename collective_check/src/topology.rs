/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use accel::AccelError;
use accel::Device;
use accel::DeviceIndex;
use accel::Runtime;

use crate::HarnessError;
use crate::process_group::ProcessGroup;

/// A participant's place in the run. Fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub rank: usize,
    pub world_size: usize,
    pub device: DeviceIndex,
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}/{} on {}", self.rank, self.world_size, self.device)
    }
}

/// The device a rank drives: ranks are dealt round-robin over the devices.
pub fn device_for_rank(rank: usize, device_count: usize) -> Result<DeviceIndex, AccelError> {
    if device_count == 0 {
        return Err(AccelError::NoDevice);
    }
    Ok(DeviceIndex(rank % device_count))
}

/// Establish the caller's identity from its process group and bind it to its
/// device.
pub fn bootstrap<P: ProcessGroup + ?Sized>(
    group: &P,
    runtime: &Runtime,
) -> Result<(Participant, Device), HarnessError> {
    let rank = group.rank();
    let world_size = group.world_size();
    tracing::info!("Process {} of {} starting", rank, world_size);

    let device_count = runtime.device_count();
    let index = device_for_rank(rank, device_count).map_err(|source| HarnessError::Bootstrap {
        rank,
        call: "device_count",
        source,
    })?;
    let device = runtime
        .select_device(index)
        .map_err(|source| HarnessError::Bootstrap {
            rank,
            call: "select_device",
            source,
        })?;
    tracing::info!("Rank {} using device {}", rank, index.0);

    Ok((
        Participant {
            rank,
            world_size,
            device: index,
        },
        device,
    ))
}
