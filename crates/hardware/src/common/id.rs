//! CPU and request identifiers.
//!
//! Completions travel from the hub back to a controller tagged with a one-byte
//! request id. Bit 3 distinguishes an I/O write buffer slot from a Miss Address
//! File slot; the low three bits are the slot index.

use std::fmt;

use super::constants::MBOX_MAX;

/// Identifier of an emulated CPU (its index in the system record).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub usize);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Marks a request id as naming an IOWB slot.
pub const IOWB_ID_MASK: u8 = 0x08;

/// One-byte id naming the Cbox slot a hub completion belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(u8);

impl RequestId {
    /// Id for MAF slot `index`.
    #[inline]
    pub const fn maf(index: usize) -> Self {
        Self((index % MBOX_MAX) as u8)
    }

    /// Id for IOWB slot `index`.
    #[inline]
    pub const fn iowb(index: usize) -> Self {
        Self((index % MBOX_MAX) as u8 | IOWB_ID_MASK)
    }

    /// Rebuilds an id from its raw byte.
    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw & (IOWB_ID_MASK | (MBOX_MAX as u8 - 1)))
    }

    /// Raw byte value.
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// `true` when the id names an IOWB slot.
    #[inline]
    pub const fn is_iowb(&self) -> bool {
        self.0 & IOWB_ID_MASK == IOWB_ID_MASK
    }

    /// Slot index with the IOWB marker stripped.
    #[inline]
    pub const fn index(&self) -> usize {
        (self.0 & !IOWB_ID_MASK) as usize
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_iowb() {
            write!(f, "iowb[{}]", self.index())
        } else {
            write!(f, "maf[{}]", self.index())
        }
    }
}
