//! Cache block payloads and load/store-queue references.
//!
//! Every buffer in the Cbox moves data in whole 64-byte blocks. This module provides:
//! 1. **Block Payload:** The `BlockData` array type and a zeroed constructor.
//! 2. **Lane Masks:** Conversion from a byte range within a block to an 8-bit lane mask.
//!    A 64-bit byte mask tracks exactly which bytes of a block were written.
//! 3. **Queue References:** The bounded list of load/store-queue slots an entry serves.

use smallvec::SmallVec;

use super::constants::{BLOCK_SIZE, LANE_BYTES, MBOX_MAX};

/// One cache block of data.
pub type BlockData = [u8; BLOCK_SIZE];

/// Index of a load/store-queue slot waiting on a Cbox entry.
pub type LsqRef = u8;

/// Up to `MBOX_MAX` load/store-queue references held inline.
pub type LsqRefs = SmallVec<[LsqRef; MBOX_MAX]>;

/// Returns an all-zero cache block.
#[inline]
pub const fn zero_block() -> BlockData {
    [0u8; BLOCK_SIZE]
}

/// Returns the lane mask covering `len` bytes starting at `offset` within a block.
///
/// Bit `n` is set when any byte of lane `n` (bytes `8n..8n+8`) is covered.
/// Ranges that run past the end of the block are clipped.
pub fn lane_mask(offset: usize, len: usize) -> u8 {
    if len == 0 || offset >= BLOCK_SIZE {
        return 0;
    }
    let end = (offset + len).min(BLOCK_SIZE);
    let first = offset / LANE_BYTES;
    let last = (end - 1) / LANE_BYTES;
    (first..=last).fold(0u8, |mask, lane| mask | (1 << lane))
}

/// Returns the byte mask covering `len` bytes starting at `offset` within a block.
///
/// Bit `n` is set when byte `n` of the block is covered; ranges are clipped
/// to the block.
pub fn byte_mask(offset: usize, len: usize) -> u64 {
    if len == 0 || offset >= BLOCK_SIZE {
        return 0;
    }
    let end = (offset + len).min(BLOCK_SIZE);
    let width = end - offset;
    let bits = if width == BLOCK_SIZE {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    bits << offset
}
