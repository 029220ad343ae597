//! Physical Address type.
//!
//! This module defines a strong type for physical addresses so block numbers,
//! raw offsets, and addresses are never mixed up. It provides:
//! 1. **Type Safety:** Every cache structure and message carries a `PhysAddr`.
//! 2. **Block Helpers:** Block-aligned base, offset within block, and alignment checks.
//! 3. **Address Space:** Classification of I/O space addresses.

use std::fmt;

use super::constants::{BLOCK_OFFSET_MASK, IO_SPACE_BIT};

/// A physical address as seen by the coherence controller and the chipset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Creates a new physical address from a raw 64-bit value.
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw 64-bit address value.
    #[inline(always)]
    pub const fn val(&self) -> u64 {
        self.0
    }

    /// Returns the address of the first byte of the containing cache block.
    #[inline]
    pub const fn block(&self) -> Self {
        Self(self.0 & !BLOCK_OFFSET_MASK)
    }

    /// Returns the byte offset of this address within its cache block.
    #[inline]
    pub const fn block_offset(&self) -> usize {
        (self.0 & BLOCK_OFFSET_MASK) as usize
    }

    /// Returns `true` if the address is a multiple of `align` (which must be a power of two).
    #[inline]
    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Returns `true` if the address selects I/O space rather than memory.
    #[inline]
    pub const fn is_io(&self) -> bool {
        self.0 & IO_SPACE_BIT != 0
    }

    /// Returns `true` if `len` bytes starting here stay inside one cache block.
    #[inline]
    pub const fn fits_in_block(&self, len: usize) -> bool {
        len > 0 && self.block_offset() + len <= BLOCK_OFFSET_MASK as usize + 1
    }
}

impl From<u64> for PhysAddr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
