// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-phase writeback driven by the supplier.
//!
//! `begin` marks dirty pages as awaiting clean; `end` transitions the pages
//! that stayed untouched in between back to clean. Zero pages created by
//! growth are handled through a single registered zero unit anchored at the
//! head of the region's first gap: a begin covering the head registers it, a
//! covering end consumes it (the pages drop to absent), and writes or
//! shrinks in between trim it. Cleaning stops at the unit's boundary; pages
//! past it, forked unit pages included, wait for their own round.

use core::ops::Range;

use crate::error::{PagerError, Result};
use crate::mapping::MappingOps;
use crate::page_state::{ContentKind, PageState};
use crate::region::RegionState;

pub(crate) fn begin(
    state: &mut RegionState,
    mapping: &dyn MappingOps,
    pages: Range<u64>,
) -> Result<()> {
    if pages.end > state.store.page_count() {
        return Err(PagerError::OutOfRange);
    }
    for page in pages.clone() {
        if state.store.state(page).is_dirty() {
            state.store.set_awaiting(page, true);
        }
    }
    // Writes through existing mappings must fault again so the re-dirty is
    // observed before `end` runs.
    mapping.downgrade_write(pages.clone());

    if let Some(gap) = state.store.first_dirty_zero() {
        if pages.contains(&gap) {
            let unit = gap..state.store.dirty_zero_run_end(gap).min(pages.end);
            log::trace!(target: "pagedmem", "writeback zero unit {unit:?}");
            state.zero_unit = Some(unit);
        }
    }
    Ok(())
}

pub(crate) fn end(state: &mut RegionState, pages: Range<u64>) -> Result<()> {
    if pages.end > state.store.page_count() {
        return Err(PagerError::OutOfRange);
    }
    let gap = state.store.first_dirty_zero();

    // Committed pages before the first gap.
    let run_end = gap.map_or(pages.end, |head| head.min(pages.end));
    for page in pages.start..run_end {
        clean_if_awaiting(state, page);
    }

    // The registered zero unit, if this end covers it.
    let unit = match &state.zero_unit {
        Some(unit) => unit.clone(),
        None => return Ok(()),
    };
    let valid = gap == Some(unit.start) && pages.start <= unit.start && unit.end <= pages.end;
    if !valid {
        return Ok(());
    }
    for page in unit {
        // Writes trim the unit before forking, so the unit only ever holds
        // zero pages.
        debug_assert!(state.store.state(page).is_dirty_zero());
        state.store.consume_zero(page);
        state.index.clear(page..page + 1);
    }
    state.zero_unit = None;
    // Cleaning stops at the unit boundary. Pages past it belong to the next
    // round, whether they were forked out of this unit or not.
    Ok(())
}

fn clean_if_awaiting(state: &mut RegionState, page: u64) {
    if let PageState::Dirty { content: ContentKind::Real, awaiting_clean: true } =
        state.store.state(page)
    {
        state.store.clean_real(page);
        state.index.clear(page..page + 1);
    }
}
