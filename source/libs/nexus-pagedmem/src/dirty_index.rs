// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Incrementally maintained index of dirty page runs.
//!
//! The index mirrors the page store: its spans are exactly the maximal runs
//! of dirty pages, keyed by whether the whole run is still zero content.
//! Every mutation site updates it in step with the store, and debug builds
//! recompute the ground truth after each public operation.

use core::ops::Range;

use nexus_range_map::RangeMap;

use crate::page_state::PageStore;

/// One maximal run of dirty pages, as reported by `query_dirty`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyRange {
    /// First page of the run.
    pub offset: u64,
    /// Run length in pages.
    pub len: u64,
    /// `true` when every page of the run is dirty zero content, so the
    /// supplier can persist it without reading any frame.
    pub is_zero: bool,
}

#[derive(Default)]
pub(crate) struct DirtyRangeIndex {
    runs: RangeMap<bool>,
}

impl DirtyRangeIndex {
    pub(crate) fn new() -> Self {
        Self { runs: RangeMap::new() }
    }

    /// Records `pages` as dirty with uniform zero-ness.
    pub(crate) fn mark(&mut self, pages: Range<u64>, is_zero: bool) {
        self.runs.insert(pages, is_zero);
    }

    /// Records `pages` as no longer dirty.
    pub(crate) fn clear(&mut self, pages: Range<u64>) {
        self.runs.remove(pages);
    }

    /// Discards everything at or beyond `new_pages`.
    pub(crate) fn truncate(&mut self, new_pages: u64) {
        self.runs.remove(new_pages..u64::MAX);
    }

    /// Reports the dirty runs intersecting `window`, clipped to it.
    pub(crate) fn query(&self, window: Range<u64>) -> Vec<DirtyRange> {
        self.runs
            .window(window)
            .map(|(range, &is_zero)| DirtyRange {
                offset: range.start,
                len: range.end - range.start,
                is_zero,
            })
            .collect()
    }

    /// Checks the index against a fresh per-page scan of the store.
    #[cfg(debug_assertions)]
    pub(crate) fn verify(&self, store: &PageStore) {
        let derived: Vec<(Range<u64>, bool)> = store.derived_dirty_runs(0..store.page_count());
        let held: Vec<(Range<u64>, bool)> =
            self.runs.iter().map(|(range, &zero)| (range, zero)).collect();
        assert_eq!(held, derived, "dirty range index diverged from page states");
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn verify(&self, _store: &PageStore) {}
}
