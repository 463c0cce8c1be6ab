// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pending supplier requests and the queue the supplier drains.
//!
//! A request covers a maximal run of pages that cannot make progress without
//! the supplier. At most one outstanding request of a given kind exists per
//! page; later accesses coalesce onto it. Callers park on the request's
//! condvar (bound to the region mutex) until a supplier action, a shrink, or
//! a detach resolves it.

use core::ops::Range;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{PagerError, Result};

/// What a request asks the supplier for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Provide content for absent pages (`supply` / `supply_zero`).
    Content,
    /// Acknowledge that clean pages are about to be modified (`mark_dirty`).
    DirtyPermission,
}

/// A request as seen by the supplier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// What is being asked for.
    pub kind: RequestKind,
    /// First page of the run.
    pub offset: u64,
    /// Run length in pages.
    pub len: u64,
}

/// Behaviour of `Supplier::take_request`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until a request arrives.
    Blocking,
    /// Return immediately when the queue is empty.
    NonBlocking,
    /// Block until a request arrives or the timeout expires.
    Timeout(Duration),
}

pub(crate) struct RequestNode {
    pub(crate) kind: RequestKind,
    pub(crate) pages: Range<u64>,
    // Written once, under the region mutex.
    outcome: Mutex<Option<Result<()>>>,
    pub(crate) cond: Condvar,
}

impl RequestNode {
    fn new(kind: RequestKind, pages: Range<u64>) -> Self {
        Self { kind, pages, outcome: Mutex::new(None), cond: Condvar::new() }
    }

    pub(crate) fn outcome(&self) -> Option<Result<()>> {
        *self.outcome.lock()
    }

    fn resolve(&self, result: Result<()>) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(result);
        }
        drop(outcome);
        self.cond.notify_all();
    }

    pub(crate) fn as_request(&self) -> PageRequest {
        PageRequest {
            kind: self.kind,
            offset: self.pages.start,
            len: self.pages.end - self.pages.start,
        }
    }
}

/// Unresolved requests plus the arrival-ordered queue the supplier sees.
#[derive(Default)]
pub(crate) struct RequestTable {
    pending: Vec<Arc<RequestNode>>,
    queue: VecDeque<Arc<RequestNode>>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self { pending: Vec::new(), queue: VecDeque::new() }
    }

    /// Existing request of `kind` covering `page`, if any.
    pub(crate) fn find_covering(&self, kind: RequestKind, page: u64) -> Option<Arc<RequestNode>> {
        self.pending
            .iter()
            .find(|node| node.kind == kind && node.pages.contains(&page))
            .cloned()
    }

    /// Creates a request for `[start, end)`, trimmed so it never overlaps an
    /// existing request of the same kind. Returns the node callers wait on.
    pub(crate) fn create(&mut self, kind: RequestKind, start: u64, end: u64) -> Arc<RequestNode> {
        let mut trimmed_end = end;
        for node in &self.pending {
            if node.kind == kind && node.pages.start > start {
                trimmed_end = trimmed_end.min(node.pages.start);
            }
        }
        debug_assert!(start < trimmed_end);
        let node = Arc::new(RequestNode::new(kind, start..trimmed_end));
        log::trace!(
            target: "pagedmem",
            "request {:?} pages {}..{}",
            kind,
            start,
            trimmed_end
        );
        self.pending.push(node.clone());
        self.queue.push_back(node.clone());
        node
    }

    /// Resolves and removes every pending request matched by `matches`.
    pub(crate) fn resolve_where(
        &mut self,
        mut matches: impl FnMut(&RequestNode) -> bool,
        result: Result<()>,
    ) {
        self.pending.retain(|node| {
            if matches(node) {
                node.resolve(result);
                false
            } else {
                true
            }
        });
    }

    /// Resolves every request `satisfied` reports as no longer needed.
    pub(crate) fn resolve_satisfied(
        &mut self,
        mut satisfied: impl FnMut(&RequestNode) -> bool,
    ) {
        self.pending.retain(|node| {
            if satisfied(node) {
                node.resolve(Ok(()));
                false
            } else {
                true
            }
        });
    }

    /// Next unresolved request in arrival order, or `None`.
    pub(crate) fn pop_next(&mut self) -> Option<Arc<RequestNode>> {
        while let Some(node) = self.queue.pop_front() {
            if node.outcome().is_none() {
                return Some(node);
            }
        }
        None
    }

    /// Fails every request intersecting `pages` with the supplier's code.
    pub(crate) fn fail_intersecting(&mut self, pages: Range<u64>, code: u32) {
        self.resolve_where(
            |node| node.pages.start < pages.end && pages.start < node.pages.end,
            Err(PagerError::SupplierFailed(code)),
        );
    }
}
