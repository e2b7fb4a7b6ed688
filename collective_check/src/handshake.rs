/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::time::Duration;

use accel::Device;
use collectives::Communicator;
use collectives::Fabric;
use collectives::UniqueId;

use crate::HarnessError;
use crate::process_group::ProcessGroup;

/// The rank that generates the communicator token.
pub const TOKEN_ROOT: usize = 0;

/// Ship the communicator token from rank 0 to every rank, byte for byte.
pub fn distribute_token<P: ProcessGroup + ?Sized>(
    group: &mut P,
    fabric: &Fabric,
) -> Result<UniqueId, HarnessError> {
    let rank = group.rank();
    let mut bytes = [0u8; UniqueId::SIZE];
    if rank == TOKEN_ROOT {
        let token = fabric.generate_unique_id();
        tracing::debug!("generated communicator token {:?}", token);
        bytes.copy_from_slice(token.as_bytes());
    }
    group
        .broadcast(&mut bytes, TOKEN_ROOT)
        .map_err(|source| HarnessError::ProcessGroup {
            rank,
            call: "broadcast",
            source,
        })?;
    UniqueId::from_bytes(&bytes).map_err(|source| HarnessError::Handshake {
        rank,
        call: "UniqueId::from_bytes",
        source,
    })
}

/// Obtain the token and join the communicator. Returns once every rank of
/// the group has joined, or fails after `timeout`.
pub fn establish<P: ProcessGroup + ?Sized>(
    group: &mut P,
    fabric: &Fabric,
    device: &Device,
    timeout: Duration,
) -> Result<Communicator, HarnessError> {
    let token = distribute_token(group, fabric)?;
    let rank = group.rank();
    tracing::debug!("rank {} joining communicator {}", rank, token.short());
    Communicator::new(fabric, device, group.world_size(), &token, rank, timeout).map_err(
        |source| HarnessError::Handshake {
            rank,
            call: "Communicator::new",
            source,
        },
    )
}
