//! Shared memory arrays.
//!
//! Physical memory is split into contiguous arrays starting at address 0. This module provides:
//! 1. **Descriptors:** Base and size per array, fixed once the system is built.
//! 2. **Routing:** Resolution of a physical address to its array.
//! 3. **Storage:** Whole-block reads and writes into each array's backing block.

use crate::common::constants::BLOCK_SIZE;
use crate::common::data::zero_block;
use crate::common::{BlockData, PhysAddr};
use crate::soc::alloc::Block;

/// One contiguous memory array.
#[derive(Debug)]
pub struct MemoryArray {
    base: PhysAddr,
    size: usize,
    block: Block,
}

impl MemoryArray {
    /// Wraps a backing block as the array starting at `base`.
    pub fn new(base: PhysAddr, block: Block) -> Self {
        let size = block.storage().len();
        Self { base, size, block }
    }

    /// First address.
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// `true` if the whole block containing `addr` lies inside this array.
    pub const fn contains(&self, addr: PhysAddr) -> bool {
        let block = addr.block().val();
        block >= self.base.val() && block + BLOCK_SIZE as u64 <= self.base.val() + self.size as u64
    }

    fn offset(&self, addr: PhysAddr) -> usize {
        (addr.block().val() - self.base.val()) as usize
    }
}

/// The memory-array descriptor table and its storage.
#[derive(Debug, Default)]
pub struct MemoryMap {
    arrays: Vec<MemoryArray>,
}

impl MemoryMap {
    /// Lays `blocks` out back to back from address 0.
    pub fn contiguous(blocks: Vec<Block>) -> Self {
        let mut base = 0u64;
        let arrays = blocks
            .into_iter()
            .map(|block| {
                let array = MemoryArray::new(PhysAddr::new(base), block);
                base += array.size() as u64;
                array
            })
            .collect();
        Self { arrays }
    }

    /// Array descriptors in address order.
    pub fn arrays(&self) -> &[MemoryArray] {
        &self.arrays
    }

    /// Index of the array backing `addr`.
    pub fn route(&self, addr: PhysAddr) -> Option<usize> {
        if addr.is_io() {
            return None;
        }
        self.arrays.iter().position(|a| a.contains(addr))
    }

    /// `true` if some array backs `addr`.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.route(addr).is_some()
    }

    /// Reads the block containing `addr`.
    pub fn read_block(&self, addr: PhysAddr) -> Option<BlockData> {
        let array = &self.arrays[self.route(addr)?];
        let offset = array.offset(addr);
        let mut block = zero_block();
        block.copy_from_slice(&array.block.storage()[offset..offset + BLOCK_SIZE]);
        Some(block)
    }

    /// Writes the block containing `addr`. Returns `false` if no array backs it.
    pub fn write_block(&mut self, addr: PhysAddr, data: &BlockData) -> bool {
        let Some(index) = self.route(addr) else {
            return false;
        };
        let array = &mut self.arrays[index];
        let offset = array.offset(addr);
        array.block.storage_mut()[offset..offset + BLOCK_SIZE].copy_from_slice(data);
        true
    }

    /// Gives the backing blocks back, leaving the map empty.
    pub fn take_blocks(&mut self) -> Vec<Block> {
        self.arrays.drain(..).map(|a| a.block).collect()
    }
}
