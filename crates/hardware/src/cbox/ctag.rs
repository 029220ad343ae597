//! Duplicate Tag Store (CTAG).
//!
//! The Cbox keeps its own copy of every primary data-cache tag so probes can be
//! answered without touching the pipeline's tag array. This module provides:
//! 1. **Pairing:** One CTAG entry per data-cache line, each naming its DTAG slot.
//! 2. **Lookup:** Set-associative search over the duplicate tags only.
//! 3. **Atomic Update:** Every state change writes the CTAG and its DTAG together.
//!
//! The primary data cache is tag-only here; block data lives in the backup cache.

use tracing::trace;

use super::state::LineState;
use crate::common::constants::BLOCK_SHIFT;
use crate::common::PhysAddr;

/// Number of primary data-cache sets.
pub const DCACHE_SETS: usize = 512;

/// Primary data-cache associativity.
pub const DCACHE_WAYS: usize = 2;

/// Shift from a physical address to its primary-cache tag.
pub const DCACHE_TAG_SHIFT: u64 = 15;

const DCACHE_SET_MASK: u64 = DCACHE_SETS as u64 - 1;

/// Primary data-cache tag, as the pipeline sees it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DtagEntry {
    /// Tag bits.
    pub tag: u64,
    /// Line holds a copy.
    pub valid: bool,
    /// Line is newer than the backup cache.
    pub dirty: bool,
    /// Other caches may hold copies.
    pub shared: bool,
}

/// Duplicate tag entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CtagEntry {
    /// Physical tag.
    pub tag: u64,
    /// Block address the line caches.
    pub addr: PhysAddr,
    /// Index of the paired entry in the primary tag array.
    pub dtag_index: usize,
    /// Line holds a copy.
    pub valid: bool,
    /// Line is newer than the backup cache.
    pub dirty: bool,
    /// Other caches may hold copies.
    pub shared: bool,
}

impl CtagEntry {
    /// Coherence state of this line.
    pub const fn state(&self) -> LineState {
        LineState {
            valid: self.valid,
            dirty: self.dirty,
            shared: self.shared,
        }
    }
}

/// Result of a duplicate-tag lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtagLookup {
    /// A valid tag matched.
    pub hit: bool,
    /// Line index (`set * DCACHE_WAYS + way`) on a hit.
    pub index: Option<usize>,
    /// State on a hit; `LineState::INVALID` on a miss.
    pub state: LineState,
}

/// A line displaced by `DuplicateTagStore::fill`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtagEviction {
    /// Block address of the displaced line.
    pub addr: PhysAddr,
    /// State it had.
    pub state: LineState,
}

/// Paired duplicate and primary tag arrays.
#[derive(Debug)]
pub struct DuplicateTagStore {
    ctags: Vec<CtagEntry>,
    dtags: Vec<DtagEntry>,
    next_way: Vec<u8>,
}

impl Default for DuplicateTagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateTagStore {
    /// Creates an empty store with every CTAG wired to its DTAG slot.
    pub fn new() -> Self {
        let lines = DCACHE_SETS * DCACHE_WAYS;
        let ctags = (0..lines)
            .map(|i| CtagEntry {
                dtag_index: i,
                ..CtagEntry::default()
            })
            .collect();
        Self {
            ctags,
            dtags: vec![DtagEntry::default(); lines],
            next_way: vec![0; DCACHE_SETS],
        }
    }

    /// Set index for `addr`.
    #[inline]
    pub const fn set_of(addr: PhysAddr) -> usize {
        ((addr.val() >> BLOCK_SHIFT) & DCACHE_SET_MASK) as usize
    }

    /// Primary-cache tag for `addr`.
    #[inline]
    pub const fn tag_of(addr: PhysAddr) -> u64 {
        addr.val() >> DCACHE_TAG_SHIFT
    }

    fn find(&self, addr: PhysAddr) -> Option<usize> {
        let base = Self::set_of(addr) * DCACHE_WAYS;
        let tag = Self::tag_of(addr);
        (base..base + DCACHE_WAYS).find(|&i| self.ctags[i].valid && self.ctags[i].tag == tag)
    }

    /// Searches the duplicate tags for `addr`.
    pub fn lookup(&self, addr: PhysAddr) -> CtagLookup {
        match self.find(addr) {
            Some(i) => CtagLookup {
                hit: true,
                index: Some(i),
                state: self.ctags[i].state(),
            },
            None => CtagLookup {
                hit: false,
                index: None,
                state: LineState::INVALID,
            },
        }
    }

    /// Duplicate tag at line `index`.
    pub fn ctag(&self, index: usize) -> Option<&CtagEntry> {
        self.ctags.get(index)
    }

    /// Primary tag at line `index`.
    pub fn dtag(&self, index: usize) -> Option<&DtagEntry> {
        self.dtags.get(index)
    }

    /// Installs `addr` in `state`, returning the line it displaced, if any.
    ///
    /// A hit just updates the state. On a miss an invalid way is used first,
    /// otherwise ways are replaced round-robin.
    pub fn fill(&mut self, addr: PhysAddr, state: LineState) -> Option<CtagEviction> {
        if let Some(i) = self.find(addr) {
            self.write_pair(i, addr, state);
            return None;
        }
        let set = Self::set_of(addr);
        let base = set * DCACHE_WAYS;
        let way = (0..DCACHE_WAYS)
            .find(|&w| !self.ctags[base + w].valid)
            .unwrap_or_else(|| {
                let w = self.next_way[set] as usize % DCACHE_WAYS;
                self.next_way[set] = ((w + 1) % DCACHE_WAYS) as u8;
                w
            });
        let index = base + way;
        let old = self.ctags[index];
        let eviction = old.valid.then_some(CtagEviction {
            addr: old.addr,
            state: old.state(),
        });
        self.write_pair(index, addr, state);
        trace!(set, way, %addr, ?state, "ctag fill");
        eviction
    }

    /// Changes the state of a resident line. Returns `false` on a miss.
    pub fn set_state(&mut self, addr: PhysAddr, state: LineState) -> bool {
        match self.find(addr) {
            Some(i) => {
                self.write_pair(i, addr, state);
                true
            }
            None => false,
        }
    }

    /// Drops `addr`, returning the state it had.
    pub fn invalidate(&mut self, addr: PhysAddr) -> Option<LineState> {
        let i = self.find(addr)?;
        let state = self.ctags[i].state();
        self.write_pair(i, addr, LineState::INVALID);
        Some(state)
    }

    /// `true` if every CTAG agrees with its paired DTAG.
    pub fn is_consistent(&self) -> bool {
        self.ctags.iter().all(|c| {
            let d = &self.dtags[c.dtag_index];
            d.valid == c.valid
                && (!c.valid || (d.tag == c.tag && d.dirty == c.dirty && d.shared == c.shared))
        })
    }

    fn write_pair(&mut self, index: usize, addr: PhysAddr, state: LineState) {
        let tag = Self::tag_of(addr);
        let dtag_index = self.ctags[index].dtag_index;
        let valid = state.valid;
        self.ctags[index] = CtagEntry {
            tag,
            addr: addr.block(),
            dtag_index,
            valid,
            dirty: valid && state.dirty,
            shared: valid && state.shared,
        };
        self.dtags[dtag_index] = DtagEntry {
            tag,
            valid,
            dirty: valid && state.dirty,
            shared: valid && state.shared,
        };
    }
}
