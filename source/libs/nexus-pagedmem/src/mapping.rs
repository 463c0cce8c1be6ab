// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Seam towards the hardware mapping layer.
//!
//! The subsystem never manipulates page tables itself. It reports write
//! permission changes through this trait so an attached mapping layer can
//! keep hardware views in sync: pages must fault on write while they are
//! clean or awaiting writeback, and may map writable once dirty.

use core::ops::Range;

/// Write-permission notifications for hardware-mapped views of a region.
///
/// Ranges are in pages. Implementations must not call back into the region.
pub trait MappingOps: Send + Sync {
    /// The pages may no longer be written through existing mappings; the
    /// next mapped write must fault.
    fn downgrade_write(&self, pages: Range<u64>);

    /// The pages became dirty and may be mapped writable.
    fn upgrade_write(&self, pages: Range<u64>);
}

/// Mapping backend for regions without hardware-mapped views.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMapping;

impl MappingOps for NullMapping {
    fn downgrade_write(&self, _pages: Range<u64>) {}

    fn upgrade_write(&self, _pages: Range<u64>) {}
}
