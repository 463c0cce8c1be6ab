// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page state and frame storage for a paged region.
//!
//! The state of a page is a sum type: a page is either absent, clean with
//! supplied content, or dirty and owed to the supplier. Zero-ness is part of
//! the content, so "absent but dirty" or "zero marker with a frame" cannot be
//! expressed. Frames exist exactly for pages whose content is real.

use core::ops::Range;

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 4096;

pub(crate) type Frame = Box<[u8; PAGE_SIZE]>;

pub(crate) fn zero_frame() -> Frame {
    Box::new([0u8; PAGE_SIZE])
}

/// What a resident page's content is, independent of cleanliness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    /// Known-zero content; no frame is committed.
    Zero,
    /// Real content backed by a committed frame.
    Real,
}

/// State of a single page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Content lives only with the supplier; access must request it.
    Absent,
    /// Supplied content the region has not modified.
    Clean(ContentKind),
    /// Content the supplier has not yet persisted.
    Dirty {
        /// Zero only for pages created by resizable growth that were never
        /// written.
        content: ContentKind,
        /// Set between `writeback_begin` and `writeback_end`; cleared again
        /// by any intervening write.
        awaiting_clean: bool,
    },
}

impl PageState {
    /// Returns `true` for either dirty variant.
    pub fn is_dirty(self) -> bool {
        matches!(self, PageState::Dirty { .. })
    }

    /// Returns `true` for a dirty page whose content is still zero.
    pub fn is_dirty_zero(self) -> bool {
        matches!(self, PageState::Dirty { content: ContentKind::Zero, .. })
    }

    /// Returns `true` when the page reads as zeroes without a frame.
    pub fn is_zero_content(self) -> bool {
        matches!(
            self,
            PageState::Clean(ContentKind::Zero)
                | PageState::Dirty { content: ContentKind::Zero, .. }
        )
    }
}

struct Slot {
    state: PageState,
    frame: Option<Frame>,
}

impl Slot {
    fn new(state: PageState) -> Self {
        Self { state, frame: None }
    }

    fn check(&self) {
        let wants_frame = matches!(
            self.state,
            PageState::Clean(ContentKind::Real)
                | PageState::Dirty { content: ContentKind::Real, .. }
        );
        debug_assert_eq!(wants_frame, self.frame.is_some());
    }
}

/// Slot vector plus frame storage for one region.
pub(crate) struct PageStore {
    slots: Vec<Slot>,
}

impl PageStore {
    /// Creates a store of `pages` slots, all in `initial` state. `initial`
    /// must be frameless (`Absent` or a zero variant).
    pub(crate) fn new(pages: u64, initial: PageState) -> Self {
        debug_assert!(!matches!(
            initial,
            PageState::Clean(ContentKind::Real)
                | PageState::Dirty { content: ContentKind::Real, .. }
        ));
        let mut slots = Vec::with_capacity(pages as usize);
        slots.resize_with(pages as usize, || Slot::new(initial));
        Self { slots }
    }

    pub(crate) fn page_count(&self) -> u64 {
        self.slots.len() as u64
    }

    pub(crate) fn byte_size(&self) -> u64 {
        self.page_count() * PAGE_SIZE as u64
    }

    pub(crate) fn state(&self, page: u64) -> PageState {
        self.slots[page as usize].state
    }

    pub(crate) fn committed_bytes(&self) -> u64 {
        self.slots.iter().filter(|slot| slot.frame.is_some()).count() as u64
            * PAGE_SIZE as u64
    }

    /// Installs supplied content on an absent page. Callers skip resident
    /// pages before getting here.
    pub(crate) fn install_supplied(&mut self, page: u64, bytes: &[u8]) {
        let slot = &mut self.slots[page as usize];
        debug_assert_eq!(slot.state, PageState::Absent);
        let mut frame = zero_frame();
        frame.copy_from_slice(bytes);
        slot.frame = Some(frame);
        slot.state = PageState::Clean(ContentKind::Real);
        slot.check();
    }

    /// Installs a zero marker on an absent page.
    pub(crate) fn install_zero_marker(&mut self, page: u64) {
        let slot = &mut self.slots[page as usize];
        debug_assert_eq!(slot.state, PageState::Absent);
        slot.state = PageState::Clean(ContentKind::Zero);
        slot.check();
    }

    /// Makes a resident page dirty with real content, committing a zeroed
    /// frame when the page was a zero variant. Returns `true` when the page
    /// was clean before (callers update the dirty index and mappings on that
    /// edge). Absent pages must be resolved first.
    pub(crate) fn make_dirty_real(&mut self, page: u64) -> bool {
        let slot = &mut self.slots[page as usize];
        let was_clean = match slot.state {
            PageState::Absent => unreachable!("dirtying an absent page"),
            PageState::Clean(_) => true,
            PageState::Dirty { .. } => false,
        };
        if slot.frame.is_none() {
            slot.frame = Some(zero_frame());
        }
        slot.state = PageState::Dirty { content: ContentKind::Real, awaiting_clean: false };
        slot.check();
        was_clean
    }

    /// Sets or clears the awaiting-clean mark on a dirty page.
    pub(crate) fn set_awaiting(&mut self, page: u64, awaiting: bool) {
        let slot = &mut self.slots[page as usize];
        if let PageState::Dirty { content, .. } = slot.state {
            slot.state = PageState::Dirty { content, awaiting_clean: awaiting };
        }
    }

    /// Transitions a dirty real page back to clean after writeback.
    pub(crate) fn clean_real(&mut self, page: u64) {
        let slot = &mut self.slots[page as usize];
        debug_assert!(matches!(
            slot.state,
            PageState::Dirty { content: ContentKind::Real, .. }
        ));
        slot.state = PageState::Clean(ContentKind::Real);
        slot.check();
    }

    /// Drops a dirty zero page entirely; the supplier has persisted the
    /// zeroes and the next access must request content again.
    pub(crate) fn consume_zero(&mut self, page: u64) {
        let slot = &mut self.slots[page as usize];
        debug_assert!(slot.state.is_dirty_zero());
        slot.frame = None;
        slot.state = PageState::Absent;
        slot.check();
    }

    /// Releases the frame of a fully-zeroed dirty page, turning it back into
    /// a dirty zero page.
    pub(crate) fn decommit_to_zero(&mut self, page: u64) {
        let slot = &mut self.slots[page as usize];
        debug_assert!(matches!(
            slot.state,
            PageState::Dirty { content: ContentKind::Real, .. }
        ));
        slot.frame = None;
        slot.state = PageState::Dirty { content: ContentKind::Zero, awaiting_clean: false };
        slot.check();
    }

    /// Copies page content into `out`. Zero variants read as zeroes.
    pub(crate) fn read_into(&self, page: u64, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= PAGE_SIZE);
        match &self.slots[page as usize].frame {
            Some(frame) => out.copy_from_slice(&frame[offset..offset + out.len()]),
            None => out.fill(0),
        }
    }

    /// Copies `src` into a committed frame. The page must hold real content.
    pub(crate) fn write_from(&mut self, page: u64, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= PAGE_SIZE);
        let frame = self.slots[page as usize]
            .frame
            .as_mut()
            .unwrap_or_else(|| unreachable!("writing a frameless page"));
        frame[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Zeroes a byte range of a committed frame.
    pub(crate) fn zero_from(&mut self, page: u64, offset: usize, len: usize) {
        debug_assert!(offset + len <= PAGE_SIZE);
        let frame = self.slots[page as usize]
            .frame
            .as_mut()
            .unwrap_or_else(|| unreachable!("zeroing a frameless page"));
        frame[offset..offset + len].fill(0);
    }

    /// Returns `true` when every byte of the page's frame is zero. Frameless
    /// pages are trivially zero.
    pub(crate) fn frame_is_zero(&self, page: u64) -> bool {
        match &self.slots[page as usize].frame {
            Some(frame) => frame.iter().all(|&b| b == 0),
            None => true,
        }
    }

    /// Grows or shrinks the store. New slots take `fill`; truncated slots
    /// drop their frames.
    pub(crate) fn resize(&mut self, new_pages: u64, fill: PageState) {
        self.slots.resize_with(new_pages as usize, || Slot::new(fill));
    }

    /// First dirty zero page of the region, the head of the first gap.
    pub(crate) fn first_dirty_zero(&self) -> Option<u64> {
        self.slots
            .iter()
            .position(|slot| slot.state.is_dirty_zero())
            .map(|index| index as u64)
    }

    /// End of the contiguous dirty zero run starting at `start`.
    pub(crate) fn dirty_zero_run_end(&self, start: u64) -> u64 {
        let mut end = start;
        while end < self.page_count() && self.state(end).is_dirty_zero() {
            end += 1;
        }
        end
    }

    /// Maximal dirty runs in `window`, split by zero-ness. This is the
    /// ground truth the dirty range index is checked against.
    pub(crate) fn derived_dirty_runs(&self, window: Range<u64>) -> Vec<(Range<u64>, bool)> {
        let mut runs: Vec<(Range<u64>, bool)> = Vec::new();
        for page in window.start..window.end.min(self.page_count()) {
            let state = self.state(page);
            if !state.is_dirty() {
                continue;
            }
            let is_zero = state.is_dirty_zero();
            match runs.last_mut() {
                Some((range, zero)) if range.end == page && *zero == is_zero => {
                    range.end = page + 1;
                }
                _ => runs.push((page..page + 1, is_zero)),
            }
        }
        runs
    }
}
