// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Externally-backed paged memory regions with dirty tracking
//!
//! OWNERS: @kernel
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - paged_region(): Create a caller/supplier handle pair over one region
//!   - struct Region: Caller-facing surface (read/write/zero/commit/resize)
//!   - struct Supplier: Backing-store surface (supply/mark_dirty/fail/writeback)
//!   - struct RegionOptions: RESIZABLE and TRAP_DIRTY creation flags
//!
//! SECURITY INVARIANTS:
//!   - Supplied zero markers are immutable until a caller write forks them
//!   - Writes to dirty pages never suspend and never reach the supplier
//!   - A shrink resolves every request beyond the new bound as out-of-range
//!
//! ERROR CONDITIONS:
//!   - PagerError::OutOfRange: Range outside the region's current bounds
//!   - PagerError::SupplierFailed: Supplier failed or detached mid-request
//!   - PagerError::InvalidRequest: Operation not valid for this region kind
//!
//! ADR: docs/adr/0016-kernel-libs-architecture.md

use core::ops::Range;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::dirty_index::{DirtyRange, DirtyRangeIndex};
use crate::error::{PagerError, Result, DETACHED_ERROR_CODE};
use crate::mapping::{MappingOps, NullMapping};
use crate::page_state::{zero_frame, ContentKind, Frame, PageState, PageStore, PAGE_SIZE};
use crate::request::{PageRequest, RequestKind, RequestNode, RequestTable, Wait};
use crate::writeback;

const PS: u64 = PAGE_SIZE as u64;

bitflags! {
    /// Creation options for a region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionOptions: u32 {
        /// The region may be resized after creation.
        const RESIZABLE = 1 << 0;
        /// Clean pages must not be dirtied until the supplier acknowledges a
        /// dirty-permission request.
        const TRAP_DIRTY = 1 << 1;
    }
}

/// Mutable region state, all guarded by one mutex.
pub(crate) struct RegionState {
    pub(crate) store: PageStore,
    pub(crate) index: DirtyRangeIndex,
    pub(crate) requests: RequestTable,
    /// Zero pages registered by a `writeback_begin` covering the head of the
    /// first gap. Consumed by a covering `writeback_end`.
    pub(crate) zero_unit: Option<Range<u64>>,
    pub(crate) detached: bool,
}

impl RegionState {
    fn verify(&self) {
        self.index.verify(&self.store);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// Content comes from and returns to an external supplier.
    Paged,
    /// Plain zero-filled memory; no supplier, no dirty tracking.
    Anonymous,
}

struct RegionInner {
    state: Mutex<RegionState>,
    /// Signalled when a new request is queued for the supplier.
    queue_cond: Condvar,
    options: RegionOptions,
    backing: Backing,
    mapping: Box<dyn MappingOps>,
}

/// Copy-on-write page overlay of a snapshot clone.
struct CloneOverlay {
    page_count: u64,
    frames: Mutex<BTreeMap<u64, Frame>>,
}

/// Caller-facing handle to a paged region.
///
/// Cloning the handle shares the region; the region is destroyed when the
/// last handle drops.
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
    overlay: Option<Arc<CloneOverlay>>,
}

/// Supplier-facing handle to a paged region. Dropping it detaches the
/// supplier: every pending and future request fails with
/// [`DETACHED_ERROR_CODE`].
pub struct Supplier {
    inner: Arc<RegionInner>,
}

/// Creates a region of `pages` pages together with its supplier handle.
///
/// Every page starts absent; the first access raises a content request on
/// the supplier side.
pub fn paged_region(pages: u64, options: RegionOptions) -> (Region, Supplier) {
    paged_region_with_mapping(pages, options, Box::new(NullMapping))
}

/// Like [`paged_region`], with a mapping layer attached. The region reports
/// write-permission changes for hardware-mapped views through `mapping`.
pub fn paged_region_with_mapping(
    pages: u64,
    options: RegionOptions,
    mapping: Box<dyn MappingOps>,
) -> (Region, Supplier) {
    log::debug!(target: "pagedmem", "create paged region: {pages} pages, {options:?}");
    let inner = Arc::new(RegionInner {
        state: Mutex::new(RegionState {
            store: PageStore::new(pages, PageState::Absent),
            index: DirtyRangeIndex::new(),
            requests: RequestTable::new(),
            zero_unit: None,
            detached: false,
        }),
        queue_cond: Condvar::new(),
        options,
        backing: Backing::Paged,
        mapping,
    });
    (Region { inner: inner.clone(), overlay: None }, Supplier { inner })
}

impl RegionInner {
    fn trap_dirty(&self) -> bool {
        self.options.contains(RegionOptions::TRAP_DIRTY)
    }

    /// Parks the caller until `node` resolves. The region mutex is released
    /// while parked and re-held on return.
    fn wait_on(
        &self,
        state: &mut MutexGuard<'_, RegionState>,
        node: &Arc<RequestNode>,
    ) -> Result<()> {
        loop {
            if let Some(result) = node.outcome() {
                return result;
            }
            node.cond.wait(state);
        }
    }

    /// Makes `page` readable, raising content requests for absent runs. The
    /// run is capped at `limit` so one access never requests beyond its own
    /// range.
    fn ensure_readable(
        &self,
        state: &mut MutexGuard<'_, RegionState>,
        page: u64,
        limit: u64,
    ) -> Result<()> {
        loop {
            if page >= state.store.page_count() {
                return Err(PagerError::OutOfRange);
            }
            if state.store.state(page) != PageState::Absent {
                return Ok(());
            }
            if state.detached {
                return Err(PagerError::SupplierFailed(DETACHED_ERROR_CODE));
            }
            let node = match state.requests.find_covering(RequestKind::Content, page) {
                Some(node) => node,
                None => {
                    let mut end = page + 1;
                    let cap = limit.min(state.store.page_count());
                    while end < cap && state.store.state(end) == PageState::Absent {
                        end += 1;
                    }
                    let node = state.requests.create(RequestKind::Content, page, end);
                    self.queue_cond.notify_all();
                    node
                }
            };
            self.wait_on(state, &node)?;
        }
    }

    /// Makes `page` dirty with real content, resolving content and (under
    /// TRAP_DIRTY) dirty-permission requests first.
    fn ensure_writable(
        &self,
        state: &mut MutexGuard<'_, RegionState>,
        page: u64,
        limit: u64,
    ) -> Result<()> {
        loop {
            if page >= state.store.page_count() {
                return Err(PagerError::OutOfRange);
            }
            match state.store.state(page) {
                PageState::Absent => {
                    self.ensure_readable(state, page, limit)?;
                }
                PageState::Dirty { content, awaiting_clean } => {
                    if content == ContentKind::Zero {
                        trim_zero_unit(state, page);
                    }
                    state.store.make_dirty_real(page);
                    if content == ContentKind::Zero {
                        state.index.mark(page..page + 1, false);
                    }
                    if content == ContentKind::Zero || awaiting_clean {
                        self.mapping.upgrade_write(page..page + 1);
                    }
                    return Ok(());
                }
                PageState::Clean(_) => {
                    if !self.trap_dirty() {
                        state.store.make_dirty_real(page);
                        state.index.mark(page..page + 1, false);
                        self.mapping.upgrade_write(page..page + 1);
                        return Ok(());
                    }
                    if state.detached {
                        return Err(PagerError::SupplierFailed(DETACHED_ERROR_CODE));
                    }
                    let node =
                        match state.requests.find_covering(RequestKind::DirtyPermission, page) {
                            Some(node) => node,
                            None => {
                                let mut end = page + 1;
                                let cap = limit.min(state.store.page_count());
                                while end < cap
                                    && matches!(state.store.state(end), PageState::Clean(_))
                                {
                                    end += 1;
                                }
                                let node =
                                    state.requests.create(RequestKind::DirtyPermission, page, end);
                                self.queue_cond.notify_all();
                                node
                            }
                        };
                    self.wait_on(state, &node)?;
                }
            }
        }
    }

    /// Resolves requests whose pages no longer need the supplier.
    fn resolve_satisfied(state: &mut RegionState) {
        let RegionState { store, requests, .. } = state;
        requests.resolve_satisfied(|node| {
            node.pages.clone().all(|page| {
                if page >= store.page_count() {
                    // Shrink resolution owns out-of-range requests.
                    return false;
                }
                match node.kind {
                    RequestKind::Content => store.state(page) != PageState::Absent,
                    RequestKind::DirtyPermission => store.state(page).is_dirty(),
                }
            })
        });
    }
}

/// Clears the part of the registered zero unit at and beyond a page about to
/// be forked to real content.
fn trim_zero_unit(state: &mut RegionState, page: u64) {
    if let Some(unit) = &mut state.zero_unit {
        if unit.contains(&page) {
            unit.end = page;
            if unit.start >= unit.end {
                state.zero_unit = None;
            }
        }
    }
}

fn check_byte_range(state: &RegionState, offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= state.store.byte_size() => Ok(()),
        _ => Err(PagerError::OutOfRange),
    }
}

fn check_page_range(state: &RegionState, first: u64, pages: u64) -> Result<Range<u64>> {
    match first.checked_add(pages) {
        Some(end) if end <= state.store.page_count() => Ok(first..end),
        _ => Err(PagerError::OutOfRange),
    }
}

impl Region {
    /// Creates a region with no supplier: plain zero-filled resizable memory.
    /// `TRAP_DIRTY` needs a supplier to acknowledge requests and is rejected.
    pub fn create_anonymous(pages: u64, options: RegionOptions) -> Result<Region> {
        if options.contains(RegionOptions::TRAP_DIRTY) {
            return Err(PagerError::InvalidRequest);
        }
        log::debug!(target: "pagedmem", "create anonymous region: {pages} pages");
        let inner = Arc::new(RegionInner {
            state: Mutex::new(RegionState {
                store: PageStore::new(pages, PageState::Clean(ContentKind::Zero)),
                index: DirtyRangeIndex::new(),
                requests: RequestTable::new(),
                zero_unit: None,
                detached: false,
            }),
            queue_cond: Condvar::new(),
            options,
            backing: Backing::Anonymous,
            mapping: Box::new(NullMapping),
        });
        Ok(Region { inner, overlay: None })
    }

    /// Current size in pages.
    pub fn page_count(&self) -> u64 {
        match &self.overlay {
            Some(overlay) => overlay.page_count,
            None => self.inner.state.lock().store.page_count(),
        }
    }

    /// Current size in bytes.
    pub fn byte_size(&self) -> u64 {
        self.page_count() * PS
    }

    /// Bytes of committed frames, excluding zero markers and gap pages.
    pub fn committed_bytes(&self) -> u64 {
        self.inner.state.lock().store.committed_bytes()
    }

    /// Reads `len` bytes starting at byte `offset`. Suspends on absent pages
    /// until the supplier provides content. Never dirties anything.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if let Some(overlay) = &self.overlay {
            return self.clone_read(overlay, offset, len);
        }
        let mut out = vec![0u8; len];
        let mut state = self.inner.state.lock();
        check_byte_range(&state, offset, len as u64)?;
        let limit = (offset + len as u64).div_ceil(PS);
        let mut done = 0usize;
        while done < len {
            let cursor = offset + done as u64;
            let page = cursor / PS;
            let in_page = (cursor % PS) as usize;
            let chunk = (PAGE_SIZE - in_page).min(len - done);
            self.inner.ensure_readable(&mut state, page, limit)?;
            state.store.read_into(page, in_page, &mut out[done..done + chunk]);
            done += chunk;
        }
        Ok(out)
    }

    /// Writes `data` starting at byte `offset`, dirtying every touched page.
    /// Under `TRAP_DIRTY`, clean pages suspend until the supplier grants
    /// permission; dirty pages never suspend. Pages written before a failure
    /// keep their contents.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(overlay) = &self.overlay {
            return self.clone_write(overlay, offset, data);
        }
        let mut state = self.inner.state.lock();
        check_byte_range(&state, offset, data.len() as u64)?;
        let limit = (offset + data.len() as u64).div_ceil(PS);
        let mut done = 0usize;
        while done < data.len() {
            let cursor = offset + done as u64;
            let page = cursor / PS;
            let in_page = (cursor % PS) as usize;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - done);
            self.inner.ensure_writable(&mut state, page, limit)?;
            state.store.write_from(page, in_page, &data[done..done + chunk]);
            done += chunk;
        }
        state.verify();
        Ok(())
    }

    /// Zeroes `len` bytes starting at byte `offset`. Ranges that are already
    /// entirely zero (absent pages, zero markers, gap pages) are a true
    /// no-op; everything else is dirtied page by page like a write.
    pub fn zero(&self, offset: u64, len: u64) -> Result<()> {
        if let Some(overlay) = &self.overlay {
            return self.clone_zero(overlay, offset, len);
        }
        let mut state = self.inner.state.lock();
        check_byte_range(&state, offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let first = offset / PS;
        let limit = (offset + len).div_ceil(PS);
        let already_zero = (first..limit).all(|page| {
            let s = state.store.state(page);
            s == PageState::Absent || s.is_zero_content()
        });
        if already_zero {
            return Ok(());
        }
        let op_end = offset + len;
        let mut cursor = offset;
        while cursor < op_end {
            let page = cursor / PS;
            let in_page = (cursor % PS) as usize;
            let chunk = ((PAGE_SIZE - in_page) as u64).min(op_end - cursor);
            if page >= state.store.page_count() {
                return Err(PagerError::OutOfRange);
            }
            if state.store.state(page).is_zero_content() {
                cursor += chunk;
                continue;
            }
            self.inner.ensure_writable(&mut state, page, limit)?;
            state.store.zero_from(page, in_page, chunk as usize);
            // A fully zeroed page beyond an existing gap does not need its
            // frame; release it back into zero content.
            if state.store.frame_is_zero(page)
                && state.store.first_dirty_zero().is_some_and(|gap| gap < page)
            {
                state.store.decommit_to_zero(page);
                state.index.mark(page..page + 1, true);
            }
            cursor += chunk;
        }
        state.verify();
        Ok(())
    }

    /// Populates `len` bytes starting at `offset` without dirtying anything:
    /// absent pages raise content requests, resident pages are untouched.
    pub fn commit(&self, offset: u64, len: u64) -> Result<()> {
        if let Some(overlay) = &self.overlay {
            return self.clone_commit(overlay, offset, len);
        }
        let mut state = self.inner.state.lock();
        check_byte_range(&state, offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let limit = (offset + len).div_ceil(PS);
        for page in offset / PS..limit {
            self.inner.ensure_readable(&mut state, page, limit)?;
        }
        Ok(())
    }

    /// Read-fault entry point for the mapping layer: makes one page
    /// resident. A [`PagerError::SupplierFailed`] return is escalated by the
    /// caller to a fatal access violation.
    pub fn fault_read(&self, page: u64) -> Result<()> {
        self.commit(page * PS, PS)
    }

    /// Write-fault entry point for the mapping layer: makes one page dirty
    /// without changing its content.
    pub fn fault_write(&self, page: u64) -> Result<()> {
        if let Some(overlay) = &self.overlay {
            return self.clone_copy_up(overlay, page);
        }
        let mut state = self.inner.state.lock();
        if page >= state.store.page_count() {
            return Err(PagerError::OutOfRange);
        }
        self.inner.ensure_writable(&mut state, page, page + 1)?;
        state.verify();
        Ok(())
    }

    /// Snapshot of one page's state, for diagnostics and fault handlers.
    pub fn page_state(&self, page: u64) -> Result<PageState> {
        if self.overlay.is_some() {
            return Err(PagerError::InvalidRequest);
        }
        let state = self.inner.state.lock();
        if page >= state.store.page_count() {
            return Err(PagerError::OutOfRange);
        }
        Ok(state.store.state(page))
    }

    /// Reports the maximal dirty runs intersecting the page range. Runs are
    /// split so `is_zero` is uniform, and never suspend or request anything.
    pub fn query_dirty(&self, first_page: u64, pages: u64) -> Result<Vec<DirtyRange>> {
        if self.overlay.is_some() || self.inner.backing == Backing::Anonymous {
            return Err(PagerError::InvalidRequest);
        }
        let state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        Ok(state.index.query(range))
    }

    /// Resizes the region. Growth appears as dirty zero pages owed to the
    /// supplier; a shrink discards state beyond the bound and resolves every
    /// request there as out-of-range.
    pub fn resize(&self, new_pages: u64) -> Result<()> {
        if self.overlay.is_some() || !self.inner.options.contains(RegionOptions::RESIZABLE) {
            return Err(PagerError::InvalidRequest);
        }
        let mut state = self.inner.state.lock();
        let old_pages = state.store.page_count();
        log::debug!(target: "pagedmem", "resize {old_pages} -> {new_pages} pages");
        if new_pages > old_pages {
            let fill = match self.inner.backing {
                Backing::Paged => {
                    PageState::Dirty { content: ContentKind::Zero, awaiting_clean: false }
                }
                Backing::Anonymous => PageState::Clean(ContentKind::Zero),
            };
            state.store.resize(new_pages, fill);
            if self.inner.backing == Backing::Paged {
                state.index.mark(old_pages..new_pages, true);
            }
        } else if new_pages < old_pages {
            state
                .requests
                .resolve_where(|node| node.pages.end > new_pages, Err(PagerError::OutOfRange));
            state.store.resize(new_pages, PageState::Absent);
            state.index.truncate(new_pages);
            if let Some(unit) = &mut state.zero_unit {
                unit.end = unit.end.min(new_pages);
                if unit.start >= unit.end {
                    state.zero_unit = None;
                }
            }
        }
        state.verify();
        Ok(())
    }

    /// Creates a snapshot clone. The clone reads through to the backing
    /// content, writes copy-on-write into a private overlay, and has no
    /// dirty tracking of its own. Clones of clones are not supported.
    pub fn clone_region(&self) -> Result<Region> {
        if self.overlay.is_some() {
            return Err(PagerError::InvalidRequest);
        }
        let page_count = self.inner.state.lock().store.page_count();
        Ok(Region {
            inner: self.inner.clone(),
            overlay: Some(Arc::new(CloneOverlay {
                page_count,
                frames: Mutex::new(BTreeMap::new()),
            })),
        })
    }

    fn clone_read(&self, overlay: &CloneOverlay, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(len as u64).ok_or(PagerError::OutOfRange)?;
        if end > overlay.page_count * PS {
            return Err(PagerError::OutOfRange);
        }
        let mut out = vec![0u8; len];
        let mut done = 0usize;
        while done < len {
            let cursor = offset + done as u64;
            let page = cursor / PS;
            let in_page = (cursor % PS) as usize;
            let chunk = (PAGE_SIZE - in_page).min(len - done);
            let hit = {
                let frames = overlay.frames.lock();
                if let Some(frame) = frames.get(&page) {
                    out[done..done + chunk].copy_from_slice(&frame[in_page..in_page + chunk]);
                    true
                } else {
                    false
                }
            };
            if !hit {
                let mut state = self.inner.state.lock();
                if page < state.store.page_count() {
                    self.inner.ensure_readable(&mut state, page, page + 1)?;
                    state.store.read_into(page, in_page, &mut out[done..done + chunk]);
                }
                // Pages beyond the shrunk parent read as zeroes.
            }
            done += chunk;
        }
        Ok(out)
    }

    /// Copies the backing content of `page` into the clone overlay.
    fn clone_copy_up(&self, overlay: &CloneOverlay, page: u64) -> Result<()> {
        if page >= overlay.page_count {
            return Err(PagerError::OutOfRange);
        }
        if overlay.frames.lock().contains_key(&page) {
            return Ok(());
        }
        let mut frame = zero_frame();
        {
            let mut state = self.inner.state.lock();
            if page < state.store.page_count() {
                self.inner.ensure_readable(&mut state, page, page + 1)?;
                state.store.read_into(page, 0, &mut frame[..]);
            }
        }
        overlay.frames.lock().entry(page).or_insert(frame);
        Ok(())
    }

    fn clone_write(&self, overlay: &CloneOverlay, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len() as u64).ok_or(PagerError::OutOfRange)?;
        if end > overlay.page_count * PS {
            return Err(PagerError::OutOfRange);
        }
        let mut done = 0usize;
        while done < data.len() {
            let cursor = offset + done as u64;
            let page = cursor / PS;
            let in_page = (cursor % PS) as usize;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - done);
            self.clone_copy_up(overlay, page)?;
            let mut frames = overlay.frames.lock();
            let frame = frames
                .get_mut(&page)
                .unwrap_or_else(|| unreachable!("copy-up left no overlay frame"));
            frame[in_page..in_page + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn clone_zero(&self, overlay: &CloneOverlay, offset: u64, len: u64) -> Result<()> {
        let end = offset.checked_add(len).ok_or(PagerError::OutOfRange)?;
        if end > overlay.page_count * PS {
            return Err(PagerError::OutOfRange);
        }
        let mut cursor = offset;
        while cursor < end {
            let page = cursor / PS;
            let in_page = (cursor % PS) as usize;
            let chunk = ((PAGE_SIZE - in_page) as u64).min(end - cursor);
            if in_page == 0 && chunk == PS {
                // Whole page: no copy-up needed.
                overlay.frames.lock().insert(page, zero_frame());
            } else {
                self.clone_copy_up(overlay, page)?;
                let mut frames = overlay.frames.lock();
                if let Some(frame) = frames.get_mut(&page) {
                    frame[in_page..in_page + chunk as usize].fill(0);
                }
            }
            cursor += chunk;
        }
        Ok(())
    }

    fn clone_commit(&self, overlay: &CloneOverlay, offset: u64, len: u64) -> Result<()> {
        let end = offset.checked_add(len).ok_or(PagerError::OutOfRange)?;
        if end > overlay.page_count * PS {
            return Err(PagerError::OutOfRange);
        }
        let mut state = self.inner.state.lock();
        for page in offset / PS..end.div_ceil(PS) {
            if overlay.frames.lock().contains_key(&page) || page >= state.store.page_count() {
                continue;
            }
            self.inner.ensure_readable(&mut state, page, page + 1)?;
        }
        Ok(())
    }
}

impl Supplier {
    /// Takes the next request off the queue in arrival order. Requests
    /// resolved before being taken (by a shrink, an unprompted `mark_dirty`,
    /// a `fail`) are skipped.
    pub fn take_request(&self, wait: Wait) -> Option<PageRequest> {
        let mut state = self.inner.state.lock();
        let deadline = match wait {
            Wait::Timeout(timeout) => Some(Instant::now() + timeout),
            Wait::Blocking | Wait::NonBlocking => None,
        };
        loop {
            if let Some(node) = state.requests.pop_next() {
                return Some(node.as_request());
            }
            match wait {
                Wait::NonBlocking => return None,
                Wait::Blocking => {
                    self.inner.queue_cond.wait(&mut state);
                }
                Wait::Timeout(_) => {
                    let deadline = deadline.unwrap_or_else(Instant::now);
                    if self
                        .inner
                        .queue_cond
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return state.requests.pop_next().map(|node| node.as_request());
                    }
                }
            }
        }
    }

    /// Provides content for absent pages starting at `first_page`. `bytes`
    /// must be a whole number of pages. Resident pages, including zero
    /// markers, are left untouched. Resolves content requests whose pages
    /// are now resident.
    pub fn supply(&self, first_page: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() || bytes.len() % PAGE_SIZE != 0 {
            return Err(PagerError::InvalidRequest);
        }
        let pages = (bytes.len() / PAGE_SIZE) as u64;
        let mut state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        for (i, page) in range.enumerate() {
            if state.store.state(page) == PageState::Absent {
                let chunk = &bytes[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
                state.store.install_supplied(page, chunk);
            }
        }
        RegionInner::resolve_satisfied(&mut state);
        state.verify();
        Ok(())
    }

    /// Installs zero markers on absent pages: the pages become resident,
    /// read as zeroes, and commit no frames until a write forks them.
    pub fn supply_zero(&self, first_page: u64, pages: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        for page in range {
            if state.store.state(page) == PageState::Absent {
                state.store.install_zero_marker(page);
            }
        }
        RegionInner::resolve_satisfied(&mut state);
        state.verify();
        Ok(())
    }

    /// Grants dirty permission: every clean page in the range becomes dirty
    /// with real content (markers commit zeroed frames). Legal unprompted.
    /// Rejected atomically when the range touches an absent page.
    pub fn mark_dirty(&self, first_page: u64, pages: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        if range.clone().any(|page| state.store.state(page) == PageState::Absent) {
            return Err(PagerError::InvalidRequest);
        }
        for page in range.clone() {
            if matches!(state.store.state(page), PageState::Clean(_)) {
                state.store.make_dirty_real(page);
                state.index.mark(page..page + 1, false);
                self.inner.mapping.upgrade_write(page..page + 1);
            }
        }
        RegionInner::resolve_satisfied(&mut state);
        state.verify();
        Ok(())
    }

    /// Fails every pending request intersecting the range, propagating
    /// `code` to the blocked callers. Page state is never changed; callers
    /// already resolved keep their pages.
    pub fn fail(&self, first_page: u64, pages: u64, code: u32) -> Result<()> {
        let mut state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        log::debug!(target: "pagedmem", "supplier failed {range:?} with code {code}");
        state.requests.fail_intersecting(range, code);
        Ok(())
    }

    /// First half of a writeback: marks dirty pages in the range as awaiting
    /// clean and registers the zero unit when the range covers the head of
    /// the first gap. Never suspends.
    pub fn writeback_begin(&self, first_page: u64, pages: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        writeback::begin(&mut state, &*self.inner.mapping, range)?;
        state.verify();
        Ok(())
    }

    /// Second half of a writeback: cleans the pages that stayed untouched
    /// since `writeback_begin`. Out-of-range is rejected with zero effect;
    /// an end without a matching begin is a no-op.
    pub fn writeback_end(&self, first_page: u64, pages: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        writeback::end(&mut state, range)?;
        state.verify();
        Ok(())
    }

    /// Same view as [`Region::query_dirty`], for supplier-side persistence
    /// scans.
    pub fn query_dirty(&self, first_page: u64, pages: u64) -> Result<Vec<DirtyRange>> {
        let state = self.inner.state.lock();
        let range = check_page_range(&state, first_page, pages)?;
        Ok(state.index.query(range))
    }

    /// Detaches the supplier. Every pending request and every future need
    /// for the supplier resolves as [`PagerError::SupplierFailed`] with
    /// [`DETACHED_ERROR_CODE`].
    pub fn detach(&self) {
        let mut state = self.inner.state.lock();
        if state.detached {
            return;
        }
        log::debug!(target: "pagedmem", "supplier detached");
        state.detached = true;
        state
            .requests
            .resolve_where(|_| true, Err(PagerError::SupplierFailed(DETACHED_ERROR_CODE)));
        self.inner.queue_cond.notify_all();
    }
}

impl Drop for Supplier {
    fn drop(&mut self) {
        self.detach();
    }
}
