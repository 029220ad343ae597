//! I/O Write Buffer Unit Tests.
//!
//! Verifies merging of same-width stores to one block, the lane-mask union,
//! issue/complete bookkeeping, and rejection of malformed stores.

use pretty_assertions::assert_eq;
use rstest::rstest;

use smpsim_core::cbox::iowb::IoWriteBuffer;
use smpsim_core::common::constants::IO_SPACE_BIT;
use smpsim_core::common::{CoherenceError, InvalidRequest, PhysAddr, Resource};

fn io(offset: u64) -> PhysAddr {
    PhysAddr::new(IO_SPACE_BIT | offset)
}

// ══════════════════════════════════════════════════════════
// 1. Merging
// ══════════════════════════════════════════════════════════

#[test]
fn adjacent_quadwords_merge_and_union_masks() {
    let mut iowb = IoWriteBuffer::new();
    let (a, merged_a) = iowb.allocate(io(0x100), &[1; 8], 0b01, 8, &[1]).unwrap();
    let (b, merged_b) = iowb.allocate(io(0x108), &[2; 8], 0b10, 8, &[2]).unwrap();
    assert!(!merged_a);
    assert!(merged_b);
    assert_eq!(a, b);

    let entry = iowb.get(a).unwrap();
    assert_eq!(entry.mask, 0b11);
    assert_eq!(entry.addr, io(0x100));
    assert_eq!(entry.buf_len, 16);
    assert_eq!(&entry.payload()[..8], &[1; 8]);
    assert_eq!(&entry.payload()[8..], &[2; 8]);
    assert_eq!(entry.lsq_refs.as_slice(), &[1, 2]);
}

#[test]
fn lower_store_extends_entry_downward() {
    let mut iowb = IoWriteBuffer::new();
    let (a, _) = iowb.allocate(io(0x110), &[9; 8], 0b100, 8, &[]).unwrap();
    let (_, merged) = iowb.allocate(io(0x100), &[8; 8], 0b001, 8, &[]).unwrap();
    assert!(merged);
    let entry = iowb.get(a).unwrap();
    assert_eq!(entry.addr, io(0x100));
    assert_eq!(entry.buf_len, 24);
    assert_eq!(entry.mask, 0b101);
    // The untouched middle lane is not part of the write.
    assert_eq!(entry.written, 0x00ff_00ff);
}

#[test]
fn differing_store_lengths_never_merge() {
    let mut iowb = IoWriteBuffer::new();
    let (a, _) = iowb.allocate(io(0x100), &[1; 8], 0b1, 8, &[]).unwrap();
    let (b, merged) = iowb.allocate(io(0x108), &[2; 4], 0b10, 4, &[]).unwrap();
    assert!(!merged);
    assert_ne!(a, b);
}

#[test]
fn different_blocks_never_merge() {
    let mut iowb = IoWriteBuffer::new();
    let (a, _) = iowb.allocate(io(0x100), &[1; 8], 0b1, 8, &[]).unwrap();
    let (b, merged) = iowb.allocate(io(0x140), &[1; 8], 0b1, 8, &[]).unwrap();
    assert!(!merged);
    assert_ne!(a, b);
}

#[test]
fn issued_entry_is_not_a_merge_target() {
    let mut iowb = IoWriteBuffer::new();
    let (a, _) = iowb.allocate(io(0x100), &[1; 8], 0b1, 8, &[]).unwrap();
    assert_eq!(iowb.issue_pending(), vec![a]);
    let (b, merged) = iowb.allocate(io(0x108), &[2; 8], 0b10, 8, &[]).unwrap();
    assert!(!merged);
    assert_ne!(a, b);
    assert!(iowb.issue_pending().contains(&b));
}

// ══════════════════════════════════════════════════════════
// 2. Completion and capacity
// ══════════════════════════════════════════════════════════

#[test]
fn completed_entry_frees_its_slot() {
    let mut iowb = IoWriteBuffer::new();
    for i in 0..8 {
        let _ = iowb.allocate(io(i * 64), &[0; 8], 1, 8, &[]).unwrap();
    }
    let err = iowb.allocate(io(0x1000), &[0; 8], 1, 8, &[]).unwrap_err();
    assert_eq!(err, CoherenceError::exhausted(Resource::IoWriteBuffer));

    let issued = iowb.issue_pending();
    assert_eq!(issued.len(), 8);
    iowb.complete(issued[0]).unwrap();
    assert_eq!(iowb.pending(), 7);
    assert!(iowb.allocate(io(0x1000), &[0; 8], 1, 8, &[]).is_ok());
}

#[test]
fn double_completion_is_rejected() {
    let mut iowb = IoWriteBuffer::new();
    let (a, _) = iowb.allocate(io(0), &[0; 8], 1, 8, &[]).unwrap();
    let _ = iowb.issue_pending();
    iowb.complete(a).unwrap();
    assert!(iowb.complete(a).is_err());
}

// ══════════════════════════════════════════════════════════
// 3. Rejection
// ══════════════════════════════════════════════════════════

#[rstest]
#[case(3)]
#[case(16)]
#[case(0)]
fn unsupported_lengths_are_rejected(#[case] len: usize) {
    let mut iowb = IoWriteBuffer::new();
    let data = vec![0u8; len];
    let err = iowb.allocate(io(0), &data, 1, len, &[]).unwrap_err();
    assert_eq!(err, InvalidRequest::StoreLength(len).into());
}

#[test]
fn store_spanning_block_is_rejected() {
    let mut iowb = IoWriteBuffer::new();
    let err = iowb.allocate(io(0x3c), &[0; 8], 0x80, 8, &[]).unwrap_err();
    assert!(matches!(
        err,
        CoherenceError::InvalidRequest(InvalidRequest::SpansBlock { .. })
    ));
    assert_eq!(iowb.pending(), 0);
}

#[test]
fn data_length_must_match_store_length() {
    let mut iowb = IoWriteBuffer::new();
    let err = iowb.allocate(io(0), &[0; 4], 1, 8, &[]).unwrap_err();
    assert_eq!(err, InvalidRequest::StoreLength(4).into());
}
