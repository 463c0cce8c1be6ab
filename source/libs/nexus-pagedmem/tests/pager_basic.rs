// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Request, supply and failure behaviour of paged regions
//! OWNERS: @kernel
//!
//! TEST_SCOPE:
//!   - Content and dirty-permission request generation and coalescing
//!   - Zero marker immutability and forking
//!   - Supplier failure and detach propagation
//!   - Clones and anonymous regions
//!
//! ADR: docs/adr/0016-kernel-libs-architecture.md

use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nexus_pagedmem::{
    paged_region, paged_region_with_mapping, MappingOps, PageRequest, PagerError, Region,
    RegionOptions, RequestKind, Supplier, Wait, DETACHED_ERROR_CODE, PAGE_SIZE,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

fn pages_of(byte: u8, pages: u64) -> Vec<u8> {
    vec![byte; pages as usize * PAGE_SIZE]
}

fn expect_request(supplier: &Supplier, kind: RequestKind, offset: u64, len: u64) {
    let request = supplier
        .take_request(Wait::Timeout(TIMEOUT))
        .expect("expected a supplier request");
    assert_eq!(request, PageRequest { kind, offset, len });
}

fn expect_no_request(supplier: &Supplier) {
    assert_eq!(supplier.take_request(Wait::NonBlocking), None);
}

fn spawn_write(region: &Region, offset: u64, data: Vec<u8>) -> JoinHandle<Result<(), PagerError>> {
    let region = region.clone();
    thread::spawn(move || region.write(offset, &data))
}

fn spawn_read(
    region: &Region,
    offset: u64,
    len: usize,
) -> JoinHandle<Result<Vec<u8>, PagerError>> {
    let region = region.clone();
    thread::spawn(move || region.read(offset, len))
}

#[test]
fn read_of_absent_run_raises_one_content_request() {
    let (region, supplier) = paged_region(4, RegionOptions::empty());
    let reader = spawn_read(&region, 0, 3 * PAGE_SIZE);
    expect_request(&supplier, RequestKind::Content, 0, 3);
    supplier.supply(0, &pages_of(0x11, 3)).unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), pages_of(0x11, 3));
    expect_no_request(&supplier);
}

#[test]
fn trap_write_blocks_until_permission_granted() {
    let (region, supplier) = paged_region(1, RegionOptions::TRAP_DIRTY);
    supplier.supply(0, &page_of(0x22)).unwrap();

    let writer = spawn_write(&region, 0, page_of(0x33));
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 1);
    // Still clean until the supplier acknowledges.
    assert_eq!(supplier.query_dirty(0, 1).unwrap(), vec![]);
    supplier.mark_dirty(0, 1).unwrap();
    writer.join().unwrap().unwrap();

    let ranges = supplier.query_dirty(0, 1).unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!((ranges[0].offset, ranges[0].len, ranges[0].is_zero), (0, 1, false));
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0x33));
}

#[test]
fn untrapped_write_dirties_without_requests() {
    let (region, supplier) = paged_region(2, RegionOptions::empty());
    supplier.supply(0, &pages_of(0x44, 2)).unwrap();
    region.write(PAGE_SIZE as u64, &page_of(0x55)).unwrap();
    expect_no_request(&supplier);
    let ranges = supplier.query_dirty(0, 2).unwrap();
    assert_eq!((ranges[0].offset, ranges[0].len, ranges[0].is_zero), (1, 1, false));
}

#[test]
fn writing_a_dirty_page_never_requests_again() {
    let (region, supplier) = paged_region(1, RegionOptions::TRAP_DIRTY);
    supplier.supply(0, &page_of(1)).unwrap();
    let writer = spawn_write(&region, 0, page_of(2));
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 1);
    supplier.mark_dirty(0, 1).unwrap();
    writer.join().unwrap().unwrap();

    // The page is dirty now; repeated writes complete inline.
    region.write(0, &page_of(3)).unwrap();
    region.write(16, &[9, 9, 9]).unwrap();
    expect_no_request(&supplier);
}

#[test]
fn requests_resolve_in_ascending_offset_order() {
    let (region, supplier) = paged_region(3, RegionOptions::TRAP_DIRTY);
    // Page 1 is resident and clean; 0 and 2 are absent.
    supplier.supply(1, &page_of(0x66)).unwrap();

    let writer = spawn_write(&region, 0, pages_of(0x77, 3));
    expect_request(&supplier, RequestKind::Content, 0, 1);
    supplier.supply(0, &page_of(0)).unwrap();
    // Pages 0 and 1 now form one clean run.
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 2);
    supplier.mark_dirty(0, 2).unwrap();
    expect_request(&supplier, RequestKind::Content, 2, 1);
    supplier.supply(2, &page_of(0)).unwrap();
    expect_request(&supplier, RequestKind::DirtyPermission, 2, 1);
    supplier.mark_dirty(2, 1).unwrap();
    writer.join().unwrap().unwrap();

    let ranges = supplier.query_dirty(0, 3).unwrap();
    assert_eq!((ranges[0].offset, ranges[0].len, ranges[0].is_zero), (0, 3, false));
}

#[test]
fn reads_never_raise_dirty_requests() {
    let (region, supplier) = paged_region(2, RegionOptions::TRAP_DIRTY);
    supplier.supply(0, &pages_of(0x88, 2)).unwrap();
    assert_eq!(region.read(0, 2 * PAGE_SIZE).unwrap(), pages_of(0x88, 2));
    expect_no_request(&supplier);
    assert_eq!(supplier.query_dirty(0, 2).unwrap(), vec![]);
}

#[test]
fn commit_raises_content_requests_only() {
    let (region, supplier) = paged_region(2, RegionOptions::TRAP_DIRTY);
    let region2 = region.clone();
    let committer = thread::spawn(move || region2.commit(0, 2 * PAGE_SIZE as u64));
    expect_request(&supplier, RequestKind::Content, 0, 2);
    supplier.supply(0, &pages_of(0, 2)).unwrap();
    committer.join().unwrap().unwrap();
    expect_no_request(&supplier);
    assert_eq!(supplier.query_dirty(0, 2).unwrap(), vec![]);
    assert_eq!(region.committed_bytes(), 2 * PAGE_SIZE as u64);
}

#[test]
fn fail_propagates_code_and_leaves_state_alone() {
    let (region, supplier) = paged_region(1, RegionOptions::TRAP_DIRTY);
    supplier.supply(0, &page_of(0xaa)).unwrap();

    let writer = spawn_write(&region, 0, page_of(0xbb));
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 1);
    supplier.fail(0, 1, 7).unwrap();
    assert_eq!(writer.join().unwrap(), Err(PagerError::SupplierFailed(7)));

    // Content and cleanliness are untouched.
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0xaa));
    assert_eq!(supplier.query_dirty(0, 1).unwrap(), vec![]);
}

#[test]
fn failed_read_keeps_pages_resolved_before_the_failure() {
    let (region, supplier) = paged_region(2, RegionOptions::empty());
    let reader = spawn_read(&region, 0, 2 * PAGE_SIZE);
    expect_request(&supplier, RequestKind::Content, 0, 2);
    // Partial supply leaves the request outstanding; the reader stays parked.
    supplier.supply(0, &page_of(0xcc)).unwrap();
    supplier.fail(1, 1, 3).unwrap();
    assert_eq!(reader.join().unwrap(), Err(PagerError::SupplierFailed(3)));
    // Page 0 kept its supplied content.
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0xcc));
}

#[test]
fn zero_markers_read_zero_and_commit_nothing() {
    let (region, supplier) = paged_region(1, RegionOptions::TRAP_DIRTY);
    supplier.supply_zero(0, 1).unwrap();
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0));
    assert_eq!(region.committed_bytes(), 0);
    expect_no_request(&supplier);
}

#[test]
fn supply_does_not_overwrite_a_zero_marker() {
    let (region, supplier) = paged_region(1, RegionOptions::empty());
    supplier.supply_zero(0, 1).unwrap();
    supplier.supply(0, &page_of(0xdd)).unwrap();
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0));
    assert_eq!(region.committed_bytes(), 0);
}

#[test]
fn writing_a_marker_forks_it_to_real_content() {
    let (region, supplier) = paged_region(1, RegionOptions::TRAP_DIRTY);
    supplier.supply_zero(0, 1).unwrap();
    let writer = spawn_write(&region, 0, vec![0xee; 4]);
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 1);
    supplier.mark_dirty(0, 1).unwrap();
    writer.join().unwrap().unwrap();

    let mut expected = page_of(0);
    expected[..4].fill(0xee);
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), expected);
    assert_eq!(region.committed_bytes(), PAGE_SIZE as u64);
    let ranges = supplier.query_dirty(0, 1).unwrap();
    assert_eq!((ranges[0].offset, ranges[0].len, ranges[0].is_zero), (0, 1, false));
}

#[test]
fn clean_run_of_markers_and_real_pages_coalesces_one_request() {
    let (region, supplier) = paged_region(3, RegionOptions::TRAP_DIRTY);
    supplier.supply_zero(0, 1).unwrap();
    supplier.supply(1, &page_of(0x10)).unwrap();
    supplier.supply_zero(2, 1).unwrap();

    let writer = spawn_write(&region, 0, pages_of(0x20, 3));
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 3);
    supplier.mark_dirty(0, 3).unwrap();
    writer.join().unwrap().unwrap();

    let ranges = supplier.query_dirty(0, 3).unwrap();
    assert_eq!((ranges[0].offset, ranges[0].len, ranges[0].is_zero), (0, 3, false));
}

#[test]
fn unprompted_mark_dirty_commits_markers() {
    let (region, supplier) = paged_region(2, RegionOptions::TRAP_DIRTY);
    supplier.supply_zero(0, 1).unwrap();
    supplier.supply(1, &page_of(0x30)).unwrap();
    supplier.mark_dirty(0, 2).unwrap();

    let ranges = supplier.query_dirty(0, 2).unwrap();
    assert_eq!((ranges[0].offset, ranges[0].len, ranges[0].is_zero), (0, 2, false));
    assert_eq!(region.committed_bytes(), 2 * PAGE_SIZE as u64);

    // No further request on write.
    region.write(0, &page_of(0x31)).unwrap();
    expect_no_request(&supplier);
}

#[test]
fn mark_dirty_rejects_absent_pages_atomically() {
    let (_region, supplier) = paged_region(2, RegionOptions::TRAP_DIRTY);
    supplier.supply(0, &page_of(1)).unwrap();
    assert_eq!(supplier.mark_dirty(0, 2), Err(PagerError::InvalidRequest));
    assert_eq!(supplier.query_dirty(0, 2).unwrap(), vec![]);
}

#[test]
fn out_of_range_supplier_operations_are_rejected() {
    let (_region, supplier) = paged_region(2, RegionOptions::empty());
    assert_eq!(supplier.supply(1, &pages_of(0, 2)), Err(PagerError::OutOfRange));
    assert_eq!(supplier.supply_zero(2, 1), Err(PagerError::OutOfRange));
    assert_eq!(supplier.mark_dirty(0, 3), Err(PagerError::OutOfRange));
    assert_eq!(supplier.fail(2, 1, 0), Err(PagerError::OutOfRange));
    assert_eq!(supplier.query_dirty(1, 2), Err(PagerError::OutOfRange));
}

#[test]
fn detach_unblocks_and_poisons_future_accesses() {
    let (region, supplier) = paged_region(1, RegionOptions::empty());
    let reader = spawn_read(&region, 0, PAGE_SIZE);
    expect_request(&supplier, RequestKind::Content, 0, 1);
    drop(supplier);
    assert_eq!(
        reader.join().unwrap(),
        Err(PagerError::SupplierFailed(DETACHED_ERROR_CODE))
    );
    // No supplier is left to answer; accesses fail immediately.
    assert_eq!(
        region.read(0, PAGE_SIZE),
        Err(PagerError::SupplierFailed(DETACHED_ERROR_CODE))
    );
}

#[test]
fn fault_write_blocks_and_surfaces_failure() {
    let (region, supplier) = paged_region(1, RegionOptions::TRAP_DIRTY);
    supplier.supply(0, &page_of(5)).unwrap();
    let region2 = region.clone();
    let faulter = thread::spawn(move || region2.fault_write(0));
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 1);
    supplier.fail(0, 1, 21).unwrap();
    assert_eq!(faulter.join().unwrap(), Err(PagerError::SupplierFailed(21)));

    // Granting permission lets a retried fault through.
    let region3 = region.clone();
    let faulter = thread::spawn(move || region3.fault_write(0));
    expect_request(&supplier, RequestKind::DirtyPermission, 0, 1);
    supplier.mark_dirty(0, 1).unwrap();
    faulter.join().unwrap().unwrap();
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(5));
}

#[test]
fn clone_writes_stay_private_and_untracked() {
    let (region, supplier) = paged_region(1, RegionOptions::TRAP_DIRTY);
    supplier.supply(0, &page_of(0x40)).unwrap();

    let clone = region.clone_region().unwrap();
    clone.write(0, &page_of(0x41)).unwrap();
    expect_no_request(&supplier);

    assert_eq!(clone.read(0, PAGE_SIZE).unwrap(), page_of(0x41));
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0x40));
    assert_eq!(supplier.query_dirty(0, 1).unwrap(), vec![]);
    assert_eq!(clone.query_dirty(0, 1), Err(PagerError::InvalidRequest));
    assert_eq!(clone.resize(2), Err(PagerError::InvalidRequest));
}

#[test]
fn clone_reads_fault_content_from_the_backing() {
    let (region, supplier) = paged_region(1, RegionOptions::empty());
    let clone = region.clone_region().unwrap();
    let clone2 = clone.clone();
    let reader = thread::spawn(move || clone2.read(0, PAGE_SIZE));
    expect_request(&supplier, RequestKind::Content, 0, 1);
    supplier.supply(0, &page_of(0x42)).unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), page_of(0x42));
    drop(region);
}

#[test]
fn clone_zero_needs_no_backing_content_for_whole_pages() {
    let (region, supplier) = paged_region(1, RegionOptions::empty());
    supplier.supply(0, &page_of(0x43)).unwrap();
    let clone = region.clone_region().unwrap();
    clone.zero(0, PAGE_SIZE as u64).unwrap();
    assert_eq!(clone.read(0, PAGE_SIZE).unwrap(), page_of(0));
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0x43));
}

#[test]
fn anonymous_region_rejects_trap_dirty() {
    assert!(matches!(
        Region::create_anonymous(1, RegionOptions::TRAP_DIRTY),
        Err(PagerError::InvalidRequest)
    ));
}

#[test]
fn anonymous_region_round_trips_without_tracking() {
    let region = Region::create_anonymous(2, RegionOptions::RESIZABLE).unwrap();
    assert_eq!(region.read(0, PAGE_SIZE).unwrap(), page_of(0));
    region.write(10, &[1, 2, 3]).unwrap();
    let bytes = region.read(8, 8).unwrap();
    assert_eq!(bytes, vec![0, 0, 1, 2, 3, 0, 0, 0]);
    assert_eq!(region.query_dirty(0, 2), Err(PagerError::InvalidRequest));
    region.resize(4).unwrap();
    assert_eq!(region.read(3 * PAGE_SIZE as u64, PAGE_SIZE).unwrap(), page_of(0));
}

#[test]
fn out_of_range_caller_operations_are_rejected() {
    let (region, supplier) = paged_region(1, RegionOptions::empty());
    supplier.supply(0, &page_of(0)).unwrap();
    let end = PAGE_SIZE as u64;
    assert_eq!(region.read(end, 1), Err(PagerError::OutOfRange));
    assert_eq!(region.write(end - 1, &[0, 0]), Err(PagerError::OutOfRange));
    assert_eq!(region.zero(0, end + 1), Err(PagerError::OutOfRange));
    assert_eq!(region.commit(end, 1), Err(PagerError::OutOfRange));
    assert_eq!(region.fault_write(1), Err(PagerError::OutOfRange));
    assert_eq!(region.query_dirty(0, 2), Err(PagerError::OutOfRange));
}

#[derive(Default)]
struct RecordingMapping {
    calls: Mutex<Vec<(&'static str, Range<u64>)>>,
}

struct RecordingMappingHandle(Arc<RecordingMapping>);

impl MappingOps for RecordingMappingHandle {
    fn downgrade_write(&self, pages: Range<u64>) {
        self.0.calls.lock().unwrap().push(("downgrade", pages));
    }

    fn upgrade_write(&self, pages: Range<u64>) {
        self.0.calls.lock().unwrap().push(("upgrade", pages));
    }
}

#[test]
fn mapping_layer_sees_permission_transitions() {
    let mapping = Arc::new(RecordingMapping::default());
    let (region, supplier) =
        paged_region_with_mapping(
            2,
            RegionOptions::empty(),
            Box::new(RecordingMappingHandle(mapping.clone())),
        );
    supplier.supply(0, &pages_of(0x50, 2)).unwrap();

    region.write(0, &page_of(0x51)).unwrap();
    assert_eq!(mapping.calls.lock().unwrap().as_slice(), &[("upgrade", 0..1)]);

    supplier.writeback_begin(0, 2).unwrap();
    assert_eq!(
        mapping.calls.lock().unwrap().last(),
        Some(&("downgrade", 0..2))
    );

    // A write between begin and end re-dirties and re-upgrades.
    region.write(0, &[1]).unwrap();
    assert_eq!(mapping.calls.lock().unwrap().last(), Some(&("upgrade", 0..1)));
}
