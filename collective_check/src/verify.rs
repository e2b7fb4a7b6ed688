/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Host-side expected values and comparison of collective outputs.
//!
//! Mismatches never stop a run. Each one is logged as it is found and
//! collected in a [`VerificationReport`].

use std::fmt;

use collectives::CollectiveKind;
use collectives::ReduceOp;

use crate::element;
use crate::element::Element;

/// How an observed element is compared with its expected value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparison {
    /// Equal, or `|observed - expected| <= tolerance`. Equal infinities
    /// match.
    Tolerance(f64),
    /// Identical bit patterns.
    Exact,
}

impl Comparison {
    pub fn matches<T: Element>(self, observed: T, expected: T) -> bool {
        match self {
            Comparison::Tolerance(tolerance) => {
                let (observed, expected) = (observed.to_f64(), expected.to_f64());
                observed == expected || (observed - expected).abs() <= tolerance
            }
            Comparison::Exact => observed.to_bits() == expected.to_bits(),
        }
    }
}

/// One output element that did not match.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub rank: usize,
    pub kind: CollectiveKind,
    pub index: usize,
    pub observed: f64,
    pub expected: f64,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank {}: {} mismatch at element {}: observed {}, expected {}",
            self.rank, self.kind, self.index, self.observed, self.expected
        )
    }
}

/// Outcome of checking one collective's output on one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub kind: CollectiveKind,
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Expected all-reduce output on every rank.
pub fn expected_all_reduce<T: Element>(op: ReduceOp, world_size: usize, count: usize) -> Vec<T> {
    element::reduce_all(op, world_size, count)
}

/// Expected all-gather output: every rank's input, concatenated in rank
/// order.
pub fn expected_all_gather<T: Element>(world_size: usize, count: usize) -> Vec<T> {
    (0..world_size)
        .flat_map(|rank| element::gather_input::<T>(rank, count))
        .collect()
}

/// Expected broadcast output on every rank, the root included.
pub fn expected_broadcast<T: Element>(value: f64, count: usize) -> Vec<T> {
    element::broadcast_input(value, count)
}

/// Compare `observed` with `expected` element by element, logging each
/// mismatch. A length difference counts as a mismatch for every element
/// present on only one side.
pub fn compare<T: Element>(
    rank: usize,
    kind: CollectiveKind,
    observed: &[T],
    expected: &[T],
    comparison: Comparison,
) -> VerificationReport {
    let mut mismatches = Vec::new();
    let len = observed.len().max(expected.len());
    for index in 0..len {
        let (o, e) = (observed.get(index), expected.get(index));
        let matched = match (o, e) {
            (Some(o), Some(e)) => comparison.matches(*o, *e),
            _ => false,
        };
        if !matched {
            let mismatch = Mismatch {
                rank,
                kind,
                index,
                observed: o.map_or(f64::NAN, |v| v.to_f64()),
                expected: e.map_or(f64::NAN, |v| v.to_f64()),
            };
            tracing::warn!("{}", mismatch);
            mismatches.push(mismatch);
        }
    }
    VerificationReport {
        kind,
        checked: len,
        mismatches,
    }
}
