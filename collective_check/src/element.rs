/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Element types and the deterministic per-rank inputs.
//!
//! Inputs are computed in the element type itself, so the host-side expected
//! values go through exactly the same rounding as the data on the device.

use std::fmt;
use std::ops::Add;
use std::ops::Div;
use std::ops::Mul;

use collectives::DataType;
use collectives::ReduceOp;

/// A floating point element the harness can exchange.
pub trait Element:
    Copy
    + PartialEq
    + PartialOrd
    + fmt::Debug
    + fmt::Display
    + Add<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Send
    + Sync
    + 'static
{
    const DATA_TYPE: DataType;

    /// Value written to outputs before a collective fills them.
    const SENTINEL: Self;

    fn from_f64(value: f64) -> Self;

    fn from_usize(value: usize) -> Self;

    fn to_f64(self) -> f64;

    /// Bit pattern, for exact comparison.
    fn to_bits(self) -> u64;

    fn max(self, other: Self) -> Self;

    fn min(self, other: Self) -> Self;

    fn encode(values: &[Self]) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Vec<Self>;

    /// Combine `self` with `other` the way a reduction with `op` does. The
    /// division for [`ReduceOp::Avg`] is applied once at the end, see
    /// [`reduce_all`].
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum | ReduceOp::Avg => self + other,
            ReduceOp::Prod => self * other,
            ReduceOp::Max => Element::max(self, other),
            ReduceOp::Min => Element::min(self, other),
        }
    }
}

macro_rules! impl_element {
    ($t:ty, $data_type:expr) => {
        impl Element for $t {
            const DATA_TYPE: DataType = $data_type;
            const SENTINEL: Self = <$t>::NAN;

            fn from_f64(value: f64) -> Self {
                value as $t
            }

            fn from_usize(value: usize) -> Self {
                value as $t
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn to_bits(self) -> u64 {
                <$t>::to_bits(self) as u64
            }

            fn max(self, other: Self) -> Self {
                <$t>::max(self, other)
            }

            fn min(self, other: Self) -> Self {
                <$t>::min(self, other)
            }

            fn encode(values: &[Self]) -> Vec<u8> {
                values.iter().flat_map(|v| v.to_le_bytes()).collect()
            }

            fn decode(bytes: &[u8]) -> Vec<Self> {
                bytes
                    .chunks_exact(std::mem::size_of::<$t>())
                    .map(|chunk| {
                        let mut buf = [0u8; std::mem::size_of::<$t>()];
                        buf.copy_from_slice(chunk);
                        <$t>::from_le_bytes(buf)
                    })
                    .collect()
            }
        }
    };
}

impl_element!(f32, DataType::Float32);
impl_element!(f64, DataType::Float64);

fn reduce_value<T: Element>(rank: usize, i: usize) -> T {
    T::from_usize(rank) * T::from_f64(100.0) + T::from_usize(i)
}

/// All-reduce input of `rank`: element `i` is `rank * 100 + i`.
pub fn reduce_input<T: Element>(rank: usize, count: usize) -> Vec<T> {
    (0..count).map(|i| reduce_value(rank, i)).collect()
}

/// All-gather input of `rank`: element `i` is `rank + i * 0.1`.
pub fn gather_input<T: Element>(rank: usize, count: usize) -> Vec<T> {
    (0..count)
        .map(|i| T::from_usize(rank) + T::from_usize(i) * T::from_f64(0.1))
        .collect()
}

/// Broadcast payload: element `i` is `value + i`, so a single-element
/// broadcast carries exactly `value`.
pub fn broadcast_input<T: Element>(value: f64, count: usize) -> Vec<T> {
    (0..count)
        .map(|i| T::from_f64(value) + T::from_usize(i))
        .collect()
}

/// Outputs are pre-filled with this before the collective runs.
pub fn sentinel<T: Element>(count: usize) -> Vec<T> {
    vec![T::SENTINEL; count]
}

/// Element-wise reduction of the all-reduce inputs of ranks `0..world_size`,
/// combined in rank order.
pub fn reduce_all<T: Element>(op: ReduceOp, world_size: usize, count: usize) -> Vec<T> {
    (0..count)
        .map(|i| {
            let mut acc: T = reduce_value(0, i);
            for rank in 1..world_size {
                acc = acc.combine(reduce_value(rank, i), op);
            }
            if op == ReduceOp::Avg {
                acc = acc / T::from_usize(world_size);
            }
            acc
        })
        .collect()
}
