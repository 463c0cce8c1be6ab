// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ordered interval map with coalescing of equal-valued neighbours
//! OWNERS: @kernel
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - struct RangeMap<V>: interval map keyed by u64 half-open ranges
//!   - RangeMap::insert(): overwrite a range with a value, merging neighbours
//!   - RangeMap::remove(): clear coverage of a range, splitting boundary spans
//!   - RangeMap::window(): clipped iteration over a query window
//!
//! DEPENDENCIES:
//!   - alloc::collections::BTreeMap: span storage
//!
//! ADR: docs/adr/0016-kernel-libs-architecture.md

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;

/// Interval map over `u64` keys. Spans are half-open, non-overlapping, and
/// adjacent spans with equal values are kept merged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeMap<V> {
    spans: BTreeMap<u64, Span<V>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Span<V> {
    end: u64,
    value: V,
}

impl<V: Clone + Eq> RangeMap<V> {
    /// Creates an empty map.
    pub const fn new() -> Self {
        Self { spans: BTreeMap::new() }
    }

    /// Returns `true` when no span is stored.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Drops every span.
    pub fn clear(&mut self) {
        self.spans.clear();
    }

    /// Returns the value covering `point`, if any.
    pub fn get(&self, point: u64) -> Option<&V> {
        let (_, span) = self.spans.range(..=point).next_back()?;
        (span.end > point).then_some(&span.value)
    }

    /// Overwrites `range` with `value`. Existing coverage inside the range is
    /// replaced; spans crossing the boundaries are split. No-op for empty
    /// ranges.
    pub fn insert(&mut self, range: Range<u64>, value: V) {
        if range.start >= range.end {
            return;
        }
        self.remove(range.clone());

        let mut start = range.start;
        let mut end = range.end;
        // Merge with an equal-valued span ending exactly at our start.
        if let Some((&prev_start, prev)) = self.spans.range(..start).next_back() {
            if prev.end == start && prev.value == value {
                start = prev_start;
                self.spans.remove(&prev_start);
            }
        }
        // Merge with an equal-valued span starting exactly at our end.
        if let Some(next) = self.spans.get(&end) {
            if next.value == value {
                end = next.end;
                self.spans.remove(&range.end);
            }
        }
        self.spans.insert(start, Span { end, value });
    }

    /// Removes all coverage of `range`, splitting spans at the boundaries.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        // A span beginning left of the range may reach into it.
        if let Some((&start, span)) = self.spans.range(..range.start).next_back() {
            if span.end > range.start {
                let tail_end = span.end;
                let value = span.value.clone();
                if let Some(head) = self.spans.get_mut(&start) {
                    head.end = range.start;
                }
                if tail_end > range.end {
                    self.spans.insert(range.end, Span { end: tail_end, value });
                }
            }
        }
        // Spans beginning inside the range.
        let inside: Vec<u64> = self
            .spans
            .range(range.start..range.end)
            .map(|(&start, _)| start)
            .collect();
        for start in inside {
            let span = match self.spans.remove(&start) {
                Some(span) => span,
                None => continue,
            };
            if span.end > range.end {
                self.spans.insert(range.end, Span { end: span.end, value: span.value });
            }
        }
    }

    /// Iterates every span in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Range<u64>, &V)> {
        self.spans.iter().map(|(&start, span)| (start..span.end, &span.value))
    }

    /// Iterates the spans intersecting `window`, clipped to it.
    pub fn window(&self, window: Range<u64>) -> impl Iterator<Item = (Range<u64>, &V)> {
        let head = self
            .spans
            .range(..window.start)
            .next_back()
            .filter(|(_, span)| span.end > window.start)
            .map(|(&start, span)| (start, span));
        head.into_iter()
            .chain(self.spans.range(window.start..window.end).map(|(&s, span)| (s, span)))
            .map(move |(start, span)| {
                let clipped = start.max(window.start)..span.end.min(window.end);
                (clipped, &span.value)
            })
            .filter(|(range, _)| range.start < range.end)
    }
}
