//! Cbox CSR Unit Tests.
//!
//! Verifies the packed field layout, range checks on writes, and packing of
//! fields that straddle a word boundary.

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use smpsim_core::cbox::csr::{CSR_COUNT, CSR_TOTAL_BITS, CSR_WORDS, CboxCsr, CboxCsrs};
use smpsim_core::common::{CoherenceError, InvalidRequest};

// ══════════════════════════════════════════════════════════
// 1. Layout
// ══════════════════════════════════════════════════════════

#[test]
fn layout_fits_four_words() {
    assert_eq!(CSR_COUNT, 78);
    assert_eq!(CSR_TOTAL_BITS, 245);
    assert!(CSR_TOTAL_BITS as usize <= CSR_WORDS * 64);
}

#[test]
fn offsets_are_contiguous() {
    let mut expected = 0;
    for &field in CboxCsr::ALL {
        assert_eq!(field.offset(), expected, "{field}");
        expected += field.width();
    }
    assert_eq!(expected, CSR_TOTAL_BITS);
}

#[test]
fn known_field_positions() {
    assert_eq!(CboxCsr::BcEnable.offset(), 9);
    assert_eq!(CboxCsr::BcSize.offset(), 84);
    assert_eq!(CboxCsr::BcSize.width(), 4);
    assert_eq!(CboxCsr::BcLatDataPattern.width(), 32);
    assert_eq!(CboxCsr::BcLatDataPattern.to_string(), "BcLatDataPattern");
}

// ══════════════════════════════════════════════════════════
// 2. Field access
// ══════════════════════════════════════════════════════════

#[test]
fn set_rejects_values_wider_than_field() {
    let mut csrs = CboxCsrs::new();
    let err = csrs.set(CboxCsr::BcSize, 0x10).unwrap_err();
    assert_eq!(
        err,
        CoherenceError::InvalidRequest(InvalidRequest::CsrValue {
            field: "BcSize",
            width: 4,
            value: 0x10,
        })
    );
    assert_eq!(csrs.get(CboxCsr::BcSize), 0);
}

#[test]
fn set_accepts_field_maximum() {
    let mut csrs = CboxCsrs::new();
    csrs.set(CboxCsr::BcLatDataPattern, u64::from(u32::MAX)).unwrap();
    assert_eq!(csrs.get(CboxCsr::BcLatDataPattern), u64::from(u32::MAX));
}

// ══════════════════════════════════════════════════════════
// 3. Packing
// ══════════════════════════════════════════════════════════

#[test]
fn single_bit_lands_at_its_offset() {
    let mut csrs = CboxCsrs::new();
    csrs.set(CboxCsr::BcEnable, 1).unwrap();
    assert_eq!(csrs.pack(), [1 << 9, 0, 0, 0]);
}

#[test]
fn field_straddling_words_is_split() {
    // BcRdWrBubbles occupies bits 127..133: one bit in word 1, five in word 2.
    let mut csrs = CboxCsrs::new();
    csrs.set(CboxCsr::BcRdWrBubbles, 0b10_1011).unwrap();
    let words = csrs.pack();
    assert_eq!(words[1], 1 << 63);
    assert_eq!(words[2], 0b1_0101);
    assert_eq!(CboxCsrs::unpack(&words).get(CboxCsr::BcRdWrBubbles), 0b10_1011);
}

#[test]
fn bits_past_last_field_are_ignored() {
    let words = [0, 0, 0, u64::MAX];
    let csrs = CboxCsrs::unpack(&words);
    assert_eq!(CboxCsrs::unpack(&csrs.pack()), csrs);
    assert_eq!(csrs.pack()[3] >> (CSR_TOTAL_BITS - 192), 0);
}

proptest! {
    #[test]
    fn unpack_of_pack_preserves_every_field(seed in prop::collection::vec(any::<u64>(), CSR_COUNT)) {
        let mut csrs = CboxCsrs::new();
        for (&field, raw) in CboxCsr::ALL.iter().zip(seed) {
            csrs.set(field, raw & field.max_value()).unwrap();
        }
        prop_assert_eq!(CboxCsrs::unpack(&csrs.pack()), csrs);
    }
}
