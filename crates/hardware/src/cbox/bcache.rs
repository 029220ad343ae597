//! Backup Cache (Bcache).
//!
//! A large, direct-mapped, physically indexed cache behind the primary data cache.
//! 1. **Sizing:** Capacity comes from the encoded `BC_SIZE` field; the encoding's
//!    set bits double as the extra index bits above the 1 MB baseline.
//! 2. **Lookup:** A hit needs a tag match on a valid line.
//! 3. **Insert:** The current occupant is evicted first; a dirty occupant is
//!    written to the victim buffer before the new tag is installed.

use tracing::trace;

use super::state::LineState;
use super::victim::{VictimBuffer, VictimDisposition, VictimHandle};
use crate::common::constants::{BLOCK_SHIFT, BLOCK_SIZE, ONE_MB};
use crate::common::data::zero_block;
use crate::common::{BlockData, InvalidRequest, PhysAddr, Result};

/// Index bits present in every configuration (1 MB of 64-byte blocks).
pub const BCACHE_IDX_FILL: u64 = 0x3fff;

/// Position of the first index bit contributed by the size encoding.
pub const BCACHE_IDX_EXT_SHIFT: u64 = 14;

/// Shift from a physical address down to its tag.
pub const BCACHE_TAG_SHIFT: u64 = 20;

/// Tag bits kept per line.
pub const BCACHE_TAG_BITS: u64 = 0x0000_0fff_ffff_ffff;

/// Supported backup-cache capacities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BcacheSize {
    /// 1 MB.
    Mb1,
    /// 2 MB.
    Mb2,
    /// 4 MB.
    Mb4,
    /// 8 MB.
    Mb8,
    /// 16 MB.
    Mb16,
}

impl BcacheSize {
    /// Every supported size, smallest first.
    pub const ALL: [Self; 5] = [Self::Mb1, Self::Mb2, Self::Mb4, Self::Mb8, Self::Mb16];

    /// Value of the `BC_SIZE` CSR field for this capacity.
    pub const fn encoding(self) -> u64 {
        match self {
            Self::Mb1 => 0b0000,
            Self::Mb2 => 0b0001,
            Self::Mb4 => 0b0011,
            Self::Mb8 => 0b0111,
            Self::Mb16 => 0b1111,
        }
    }

    /// Decodes a `BC_SIZE` field value.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::BcacheEncoding` for any value outside the table.
    pub fn from_encoding(bits: u64) -> Result<Self> {
        match bits {
            0b0000 => Ok(Self::Mb1),
            0b0001 => Ok(Self::Mb2),
            0b0011 => Ok(Self::Mb4),
            0b0111 => Ok(Self::Mb8),
            0b1111 => Ok(Self::Mb16),
            other => Err(InvalidRequest::BcacheEncoding(other).into()),
        }
    }

    /// Capacity in megabytes.
    pub const fn megabytes(self) -> u32 {
        match self {
            Self::Mb1 => 1,
            Self::Mb2 => 2,
            Self::Mb4 => 4,
            Self::Mb8 => 8,
            Self::Mb16 => 16,
        }
    }

    /// Looks up a capacity in megabytes.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::BcacheSize` for any size outside the table.
    pub fn from_megabytes(mb: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.megabytes() == mb)
            .ok_or_else(|| InvalidRequest::BcacheSize(mb).into())
    }

    /// Capacity in bytes.
    pub const fn bytes(self) -> usize {
        self.megabytes() as usize * ONE_MB
    }

    /// Number of 64-byte lines.
    pub const fn lines(self) -> usize {
        self.bytes() / BLOCK_SIZE
    }

    /// Mask applied to `pa >> 6` to form the line index.
    pub const fn index_mask(self) -> u64 {
        (self.encoding() << BCACHE_IDX_EXT_SHIFT) | BCACHE_IDX_FILL
    }
}

/// Tag array entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BcacheTag {
    /// Tag bits of the cached block.
    pub tag: u64,
    /// Block address of the cached block.
    pub addr: PhysAddr,
    /// Line holds a copy.
    pub valid: bool,
    /// Copy is newer than memory.
    pub dirty: bool,
    /// Other caches may hold copies.
    pub shared: bool,
}

impl BcacheTag {
    /// Coherence state of this line.
    pub const fn state(&self) -> LineState {
        LineState {
            valid: self.valid,
            dirty: self.dirty,
            shared: self.shared,
        }
    }
}

/// Result of a tag lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BcacheLookup {
    /// Tag matched a valid line.
    pub hit: bool,
    /// Line index the address maps to.
    pub index: usize,
    /// State of the line on a hit; `LineState::INVALID` on a miss.
    pub state: LineState,
}

/// A line pushed out by `BackupCache::insert`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BcacheEviction {
    /// Block address of the evicted line.
    pub addr: PhysAddr,
    /// State the line had.
    pub state: LineState,
    /// Victim slot holding the data, for dirty lines.
    pub victim: Option<VictimHandle>,
}

/// Direct-mapped backup cache with data.
#[derive(Debug)]
pub struct BackupCache {
    size: BcacheSize,
    tags: Vec<BcacheTag>,
    blocks: Vec<BlockData>,
}

impl BackupCache {
    /// Creates an empty cache of the given capacity.
    pub fn new(size: BcacheSize) -> Self {
        let lines = size.lines();
        Self {
            size,
            tags: vec![BcacheTag::default(); lines],
            blocks: vec![zero_block(); lines],
        }
    }

    /// Configured capacity.
    #[inline]
    pub const fn size(&self) -> BcacheSize {
        self.size
    }

    /// Line index for `addr`.
    #[inline]
    pub const fn index_of(&self, addr: PhysAddr) -> usize {
        ((addr.val() >> BLOCK_SHIFT) & self.size.index_mask()) as usize
    }

    /// Tag bits for `addr`.
    #[inline]
    pub const fn tag_of(addr: PhysAddr) -> u64 {
        (addr.val() >> BCACHE_TAG_SHIFT) & BCACHE_TAG_BITS
    }

    /// Looks up the line for `addr`.
    pub fn lookup(&self, addr: PhysAddr) -> BcacheLookup {
        let index = self.index_of(addr);
        let entry = &self.tags[index];
        let hit = entry.valid && entry.tag == Self::tag_of(addr) && entry.addr == addr.block();
        BcacheLookup {
            hit,
            index,
            state: if hit { entry.state() } else { LineState::INVALID },
        }
    }

    /// Valid line currently occupying `addr`'s index, whatever its tag.
    pub fn occupant(&self, addr: PhysAddr) -> Option<BcacheTag> {
        let entry = self.tags[self.index_of(addr)];
        entry.valid.then_some(entry)
    }

    /// Block data for `addr` on a hit.
    pub fn read(&self, addr: PhysAddr) -> Option<&BlockData> {
        let found = self.lookup(addr);
        found.hit.then(|| &self.blocks[found.index])
    }

    /// Overwrites `bytes` at `addr`'s offset on a hit. Returns `false` on a miss.
    pub fn write(&mut self, addr: PhysAddr, bytes: &[u8]) -> bool {
        let found = self.lookup(addr);
        if !found.hit {
            return false;
        }
        let offset = addr.block_offset();
        let end = (offset + bytes.len()).min(BLOCK_SIZE);
        self.blocks[found.index][offset..end].copy_from_slice(&bytes[..end - offset]);
        true
    }

    /// Sets the state of a resident line. Returns `false` on a miss.
    ///
    /// Setting an invalid state drops the line.
    pub fn set_state(&mut self, addr: PhysAddr, state: LineState) -> bool {
        let found = self.lookup(addr);
        if !found.hit {
            return false;
        }
        let entry = &mut self.tags[found.index];
        entry.valid = state.valid;
        entry.dirty = state.valid && state.dirty;
        entry.shared = state.valid && state.shared;
        true
    }

    /// Installs `data` for `addr` in `state`, evicting the current occupant.
    ///
    /// A dirty occupant (other than `addr` itself) goes to the victim buffer
    /// with disposition `evict_to` before the new tag is written.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if a dirty occupant needs a victim slot and none is
    /// free; the cache is left untouched.
    pub fn insert(
        &mut self,
        addr: PhysAddr,
        data: &BlockData,
        state: LineState,
        victims: &mut VictimBuffer,
        evict_to: VictimDisposition,
    ) -> Result<Option<BcacheEviction>> {
        let index = self.index_of(addr);
        let occupant = self.tags[index];
        let mut eviction = None;

        if occupant.valid && occupant.addr != addr.block() {
            let victim = if occupant.dirty {
                Some(victims.allocate(occupant.addr, &self.blocks[index], evict_to)?)
            } else {
                None
            };
            trace!(index, evicted = %occupant.addr, dirty = occupant.dirty, "bcache evict");
            eviction = Some(BcacheEviction {
                addr: occupant.addr,
                state: occupant.state(),
                victim,
            });
        }

        self.tags[index] = BcacheTag {
            tag: Self::tag_of(addr),
            addr: addr.block(),
            valid: true,
            dirty: state.dirty,
            shared: state.shared,
        };
        self.blocks[index] = *data;
        trace!(index, %addr, ?state, "bcache install");
        Ok(eviction)
    }

    /// Drops the line for `addr`, returning its state and data if it was resident.
    pub fn invalidate(&mut self, addr: PhysAddr) -> Option<(LineState, BlockData)> {
        let found = self.lookup(addr);
        if !found.hit {
            return None;
        }
        let state = self.tags[found.index].state();
        self.tags[found.index] = BcacheTag::default();
        Some((state, self.blocks[found.index]))
    }
}
