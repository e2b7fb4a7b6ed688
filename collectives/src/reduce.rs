/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Element-wise reduction of little-endian encoded contributions.

use crate::DataType;
use crate::ReduceOp;

trait Scalar: Copy {
    const SIZE: usize;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, out: &mut Vec<u8>);
    fn combine(self, other: Self, op: ReduceOp) -> Self;
    fn average(self, count: usize) -> Self;
}

macro_rules! impl_int_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }

            fn write(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            // Integer reductions wrap on overflow.
            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum | ReduceOp::Avg => self.wrapping_add(other),
                    ReduceOp::Prod => self.wrapping_mul(other),
                    ReduceOp::Max => Ord::max(self, other),
                    ReduceOp::Min => Ord::min(self, other),
                }
            }

            fn average(self, count: usize) -> Self {
                self / (count as $t)
            }
        }
    )*};
}

macro_rules! impl_float_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }

            fn write(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum | ReduceOp::Avg => self + other,
                    ReduceOp::Prod => self * other,
                    ReduceOp::Max => self.max(other),
                    ReduceOp::Min => self.min(other),
                }
            }

            fn average(self, count: usize) -> Self {
                self / (count as $t)
            }
        }
    )*};
}

impl_int_scalar!(i8, u8, i32, u32, i64, u64);
impl_float_scalar!(f32, f64);

/// Reduce `count` elements from every contribution, combining them in
/// contribution (rank) order.
pub(crate) fn reduce<C: AsRef<[u8]>>(
    data_type: DataType,
    op: ReduceOp,
    contributions: &[C],
    count: usize,
) -> Vec<u8> {
    match data_type {
        DataType::Int8 => reduce_typed::<i8, C>(op, contributions, count),
        DataType::Uint8 => reduce_typed::<u8, C>(op, contributions, count),
        DataType::Int32 => reduce_typed::<i32, C>(op, contributions, count),
        DataType::Uint32 => reduce_typed::<u32, C>(op, contributions, count),
        DataType::Int64 => reduce_typed::<i64, C>(op, contributions, count),
        DataType::Uint64 => reduce_typed::<u64, C>(op, contributions, count),
        DataType::Float32 => reduce_typed::<f32, C>(op, contributions, count),
        DataType::Float64 => reduce_typed::<f64, C>(op, contributions, count),
    }
}

fn reduce_typed<T: Scalar, C: AsRef<[u8]>>(
    op: ReduceOp,
    contributions: &[C],
    count: usize,
) -> Vec<u8> {
    let Some((first, rest)) = contributions.split_first() else {
        return Vec::new();
    };
    let element = |contribution: &C, i: usize| {
        T::read(&contribution.as_ref()[i * T::SIZE..(i + 1) * T::SIZE])
    };
    let mut out = Vec::with_capacity(count * T::SIZE);
    for i in 0..count {
        let mut acc = element(first, i);
        for contribution in rest {
            acc = acc.combine(element(contribution, i), op);
        }
        if op == ReduceOp::Avg {
            acc = acc.average(contributions.len());
        }
        acc.write(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_f32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn decode_f32(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn sum_f32() {
        let contributions = vec![encode_f32(&[1.0, 2.0]), encode_f32(&[10.0, 20.0])];
        let out = reduce(DataType::Float32, ReduceOp::Sum, &contributions, 2);
        assert_eq!(decode_f32(&out), vec![11.0, 22.0]);
    }

    #[test]
    fn ops_f32() {
        let contributions = vec![
            encode_f32(&[2.0]),
            encode_f32(&[-3.0]),
            encode_f32(&[4.0]),
        ];
        let run = |op| decode_f32(&reduce(DataType::Float32, op, &contributions, 1))[0];
        assert_eq!(run(ReduceOp::Prod), -24.0);
        assert_eq!(run(ReduceOp::Max), 4.0);
        assert_eq!(run(ReduceOp::Min), -3.0);
        assert_eq!(run(ReduceOp::Avg), 1.0);
    }

    #[test]
    fn integers_wrap() {
        let contributions = vec![vec![200u8], vec![100u8]];
        assert_eq!(
            reduce(DataType::Uint8, ReduceOp::Sum, &contributions, 1),
            vec![44u8]
        );
        let contributions: Vec<Vec<u8>> = [7i64, -2]
            .iter()
            .map(|v| v.to_le_bytes().to_vec())
            .collect();
        let out = reduce(DataType::Int64, ReduceOp::Max, &contributions, 1);
        assert_eq!(i64::from_le_bytes(out.try_into().unwrap()), 7);
    }

    #[test]
    fn only_count_elements_are_reduced() {
        let contributions = vec![encode_f32(&[1.0, 5.0]), encode_f32(&[1.0, 5.0])];
        let out = reduce(DataType::Float32, ReduceOp::Sum, &contributions, 1);
        assert_eq!(decode_f32(&out), vec![2.0]);
    }

    #[test]
    fn empty() {
        let contributions: Vec<Vec<u8>> = vec![vec![], vec![]];
        assert!(reduce(DataType::Float64, ReduceOp::Sum, &contributions, 0).is_empty());
        let none: Vec<Vec<u8>> = Vec::new();
        assert!(reduce(DataType::Float64, ReduceOp::Sum, &none, 0).is_empty());
    }
}
