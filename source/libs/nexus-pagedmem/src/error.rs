// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for paged-region operations.

use thiserror::Error;

/// Result type returned by paged-region operations.
pub type Result<T> = core::result::Result<T, PagerError>;

/// Error code reported to blocked callers when the supplier detaches.
pub const DETACHED_ERROR_CODE: u32 = u32::MAX;

/// Errors surfaced by region and supplier operations.
///
/// Anything not covered here is an internal invariant violation and asserts
/// instead of being patched up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PagerError {
    /// The named range reaches outside the region's current bounds.
    #[error("range is outside the region bounds")]
    OutOfRange,
    /// The supplier failed a request this operation depended on. Carries the
    /// supplier's error code; mapped accesses escalate this to an access
    /// violation.
    #[error("supplier failed the request (code {0})")]
    SupplierFailed(u32),
    /// The operation is not valid for this kind of region.
    #[error("operation is not valid for this region")]
    InvalidRequest,
}
