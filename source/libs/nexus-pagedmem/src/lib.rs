// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Externally-backed, dirty-tracked paged memory regions
//! OWNERS: @kernel
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! PUBLIC API:
//!   - paged_region(): Create a caller/supplier handle pair
//!   - struct Region: read/write/zero/commit/resize/query_dirty/clone
//!   - struct Supplier: take_request/supply/mark_dirty/fail/writeback
//!   - trait MappingOps: write-permission seam for hardware mappings
//!   - PagerError / Result: error taxonomy
//!
//! SECURITY INVARIANTS:
//!   - Page state is a sum type; absent-but-dirty cannot be expressed
//!   - The supplier mutates regions only through its own entry points
//!   - Dirty content survives until the supplier completes a writeback
//!
//! DEPENDENCIES:
//!   - parking_lot: region mutex and request condvars
//!   - nexus-range-map: dirty range index storage
//!
//! ADR: docs/adr/0016-kernel-libs-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod dirty_index;
mod error;
mod mapping;
mod page_state;
mod region;
mod request;
mod writeback;

pub use dirty_index::DirtyRange;
pub use error::{PagerError, Result, DETACHED_ERROR_CODE};
pub use mapping::{MappingOps, NullMapping};
pub use page_state::{ContentKind, PageState, PAGE_SIZE};
pub use region::{paged_region, paged_region_with_mapping, Region, RegionOptions, Supplier};
pub use request::{PageRequest, RequestKind, Wait};
