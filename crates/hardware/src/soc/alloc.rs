//! Block allocation collaborator.
//!
//! Every record built at startup is backed by a block obtained from an allocator. It provides:
//! 1. **Classes:** The system record, one block per CPU, and one per memory array.
//! 2. **Contract:** Allocation is all-or-nothing and zero-initialized; release returns the block.
//! 3. **Heap allocator:** A default implementation that tracks live blocks for leak checks.
//!
//! The allocator is a trait so startup rollback can be exercised against a mock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::common::CpuId;

/// What a block is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockClass {
    /// The system record.
    System,
    /// Per-CPU interface record and Cbox arrays.
    Cpu(CpuId),
    /// Backing storage for one memory array.
    MemoryArray {
        /// Array index.
        index: usize,
        /// Size in bytes.
        bytes: usize,
    },
}

impl BlockClass {
    /// Bytes of zeroed storage a block of this class carries.
    pub const fn storage_bytes(self) -> usize {
        match self {
            Self::MemoryArray { bytes, .. } => bytes,
            Self::System | Self::Cpu(_) => 0,
        }
    }
}

/// A block handed out by an allocator.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    id: u64,
    class: BlockClass,
    storage: Vec<u8>,
}

impl Block {
    /// Creates a zeroed block of `class`.
    pub fn zeroed(id: u64, class: BlockClass) -> Self {
        Self {
            id,
            class,
            storage: vec![0; class.storage_bytes()],
        }
    }

    /// Allocator-assigned id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Class the block was allocated for.
    pub const fn class(&self) -> BlockClass {
        self.class
    }

    /// Backing bytes.
    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    /// Mutable backing bytes.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }
}

/// Source of startup blocks.
///
/// Implementations must be `Send + Sync`; the system releases its blocks from
/// whichever thread tears it down.
pub trait BlockAllocator: Send + Sync {
    /// Returns a zeroed block for `class`, or `None` if none is available.
    fn allocate_block(&self, class: BlockClass) -> Option<Block>;

    /// Returns a block to the allocator.
    fn release_block(&self, block: Block);
}

/// Allocator backed by the heap that remembers which blocks are live.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
    limit: Option<usize>,
}

impl HeapAllocator {
    /// Creates an unbounded allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator that refuses any allocation beyond `limit` live blocks.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Number of blocks handed out and not yet released.
    pub fn live_blocks(&self) -> usize {
        self.live.lock().len()
    }
}

impl BlockAllocator for HeapAllocator {
    fn allocate_block(&self, class: BlockClass) -> Option<Block> {
        let mut live = self.live.lock();
        if self.limit.is_some_and(|limit| live.len() >= limit) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = live.insert(id);
        trace!(id, ?class, "block allocate");
        Some(Block::zeroed(id, class))
    }

    fn release_block(&self, block: Block) {
        let _ = self.live.lock().remove(&block.id);
        trace!(id = block.id, class = ?block.class, "block release");
    }
}
