//! Miss Address File (MAF).
//!
//! The MAF tracks every cache miss a CPU has in flight. It provides:
//! 1. **Allocation:** Reserve one of eight slots for a miss, rejecting misaligned requests.
//! 2. **Merging:** Fold a load miss into a live entry for the same block.
//! 3. **Completion:** Mark an entry complete when the hub answers (exactly once).
//! 4. **Consumption:** Hand the fill to the pipeline and free the slot.

use tracing::trace;

use crate::common::constants::{BLOCK_SIZE, MAF_ENTRIES, MBOX_MAX};
use crate::common::{
    BlockData, CoherenceError, InvalidRequest, LsqRef, LsqRefs, PhysAddr, RequestId, Resource,
    Result,
};

/// Width of a load or store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    /// 1 byte.
    Byte = 1,
    /// 2 bytes.
    Word = 2,
    /// 4 bytes.
    Long = 4,
    /// 8 bytes.
    Quad = 8,
}

impl AccessWidth {
    /// Width in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Maps a byte count to a width.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::StoreLength` for anything other than 1, 2, 4, or 8.
    pub fn from_bytes(len: usize) -> Result<Self> {
        match len {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Long),
            8 => Ok(Self::Quad),
            other => Err(InvalidRequest::StoreLength(other).into()),
        }
    }
}

/// Kind of memory reference a MAF entry tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MafType {
    /// Load (LDx).
    Load(AccessWidth),
    /// Store (STx).
    Store(AccessWidth),
    /// Store-conditional (STx_C).
    StoreConditional(AccessWidth),
    /// Store to a line held clean; needs ownership but no data.
    StoreChangeToDirty(AccessWidth),
    /// Store-conditional to a line held clean.
    StoreCondChangeToDirty(AccessWidth),
    /// Write-hint: claim a whole block without reading it.
    Wh64,
    /// Evict cache block.
    Ecb,
    /// Instruction-stream fill.
    Istream,
    /// Memory barrier.
    MemoryBarrier,
}

impl MafType {
    /// Alignment the address must satisfy.
    pub const fn alignment(self) -> u64 {
        match self {
            Self::Load(w)
            | Self::Store(w)
            | Self::StoreConditional(w)
            | Self::StoreChangeToDirty(w)
            | Self::StoreCondChangeToDirty(w) => w as u64,
            Self::Wh64 | Self::Ecb => BLOCK_SIZE as u64,
            Self::Istream => 4,
            Self::MemoryBarrier => 1,
        }
    }

    /// Number of bytes the reference touches.
    pub const fn length(self) -> usize {
        match self {
            Self::Load(w)
            | Self::Store(w)
            | Self::StoreConditional(w)
            | Self::StoreChangeToDirty(w)
            | Self::StoreCondChangeToDirty(w) => w as usize,
            Self::Wh64 | Self::Ecb => BLOCK_SIZE,
            Self::Istream => 4,
            Self::MemoryBarrier => 0,
        }
    }

    /// `true` for references that need the line exclusively and dirty.
    pub const fn needs_ownership(self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::StoreConditional(_)
                | Self::StoreChangeToDirty(_)
                | Self::StoreCondChangeToDirty(_)
                | Self::Wh64
        )
    }

    /// `true` for the change-to-dirty variants.
    pub const fn is_change_to_dirty(self) -> bool {
        matches!(
            self,
            Self::StoreChangeToDirty(_) | Self::StoreCondChangeToDirty(_)
        )
    }

    /// `true` for references that may share one entry with a later miss to the same block.
    pub const fn merges(self) -> bool {
        matches!(self, Self::Load(_) | Self::Istream)
    }
}

/// Index of a MAF slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MafHandle(pub(crate) u8);

impl MafHandle {
    /// Slot index.
    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Request id naming this slot in hub completions.
    #[inline]
    pub const fn request_id(&self) -> RequestId {
        RequestId::maf(self.0 as usize)
    }
}

/// One MAF slot.
#[derive(Clone, Debug, Default)]
pub struct MafEntry {
    /// Reference kind; `None` while the slot is unused.
    pub kind: Option<MafType>,
    /// Physical address of the reference.
    pub addr: PhysAddr,
    /// Byte mask of the bytes the reference touches.
    pub mask: u64,
    /// Load/store-queue slots waiting on this entry.
    pub lsq_refs: LsqRefs,
    /// Length of the reference in bytes.
    pub data_len: usize,
    /// Bytes the fill will deliver.
    pub buf_len: usize,
    /// Slot occupied.
    pub valid: bool,
    /// Hub has answered; set only by the controller.
    pub complete: bool,
    /// Fill arrived with other sharers.
    pub shared: bool,
    /// Reference targets I/O space.
    pub io_request: bool,
    fill: Option<Box<BlockData>>,
    nxm: bool,
}

/// What the pipeline receives when it consumes a completed entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MafCompletion {
    /// Reference kind.
    pub kind: MafType,
    /// Address of the reference.
    pub addr: PhysAddr,
    /// Block delivered by the hub, if the reference moves data.
    pub data: Option<Box<BlockData>>,
    /// Fill arrived with other sharers.
    pub shared: bool,
    /// Load/store-queue slots to wake.
    pub lsq_refs: LsqRefs,
}

/// Fixed-capacity file of outstanding misses.
#[derive(Debug)]
pub struct MissAddressFile {
    entries: Vec<MafEntry>,
}

impl Default for MissAddressFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MissAddressFile {
    /// Creates an empty file with `MAF_ENTRIES` slots.
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(MAF_ENTRIES);
        entries.resize_with(MAF_ENTRIES, MafEntry::default);
        Self { entries }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    /// Returns the entry behind `handle` if it is occupied.
    pub fn get(&self, handle: MafHandle) -> Option<&MafEntry> {
        self.entries.get(handle.index()).filter(|e| e.valid)
    }

    /// Returns `true` once the hub has answered the entry.
    pub fn is_complete(&self, handle: MafHandle) -> bool {
        self.get(handle).is_some_and(|e| e.complete)
    }

    /// Finds a live, incomplete entry of `kind` for the block containing `addr`.
    pub fn find_pending(&self, kind: MafType, addr: PhysAddr) -> Option<MafHandle> {
        self.entries
            .iter()
            .position(|e| {
                e.valid && !e.complete && e.kind == Some(kind) && e.addr.block() == addr.block()
            })
            .map(|i| MafHandle(i as u8))
    }

    /// Checks a request without touching any slot.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a misaligned address, an access that spans a
    /// block, or more than `MBOX_MAX` references.
    pub fn validate(kind: MafType, addr: PhysAddr, refs: &[LsqRef]) -> Result<()> {
        let align = kind.alignment();
        if !addr.is_aligned(align) {
            return Err(InvalidRequest::Misaligned { addr, align }.into());
        }
        let len = kind.length();
        if len > 0 && !addr.fits_in_block(len) {
            return Err(InvalidRequest::SpansBlock { addr, len }.into());
        }
        if refs.len() > MBOX_MAX {
            return Err(InvalidRequest::TooManyRefs(refs.len()).into());
        }
        Ok(())
    }

    /// Records a miss.
    ///
    /// A load or instruction-fetch miss to a block with a live, incomplete entry
    /// of the same kind joins that entry. The returned flag is `true` for a merge,
    /// in which case no new request must be sent.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a misaligned address, an access that spans a block,
    /// or more than `MBOX_MAX` references; `ResourceExhausted` when all slots are
    /// occupied and no merge is possible. Nothing changes on error.
    pub fn allocate(
        &mut self,
        kind: MafType,
        addr: PhysAddr,
        mask: u64,
        refs: &[LsqRef],
    ) -> Result<(MafHandle, bool)> {
        Self::validate(kind, addr, refs)?;
        let len = kind.length();

        if kind.merges() {
            if let Some(handle) = self.find_pending(kind, addr) {
                let entry = &mut self.entries[handle.index()];
                if entry.lsq_refs.len() + refs.len() <= MBOX_MAX {
                    entry.lsq_refs.extend_from_slice(refs);
                    entry.mask |= mask;
                    trace!(slot = handle.index(), %addr, "maf merge");
                    return Ok((handle, true));
                }
            }
        }

        let Some(index) = self.entries.iter().position(|e| !e.valid) else {
            return Err(CoherenceError::exhausted(Resource::MissAddressFile));
        };
        self.entries[index] = MafEntry {
            kind: Some(kind),
            addr,
            mask,
            lsq_refs: refs.iter().copied().collect(),
            data_len: len,
            buf_len: if len == 0 { 0 } else { BLOCK_SIZE },
            valid: true,
            complete: false,
            shared: false,
            io_request: addr.is_io(),
            fill: None,
            nxm: false,
        };
        trace!(slot = index, %addr, ?kind, "maf allocate");
        Ok((MafHandle(index as u8), false))
    }

    /// Marks an entry complete with the hub's fill.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::StaleHandle` if the slot is not occupied,
    /// `InvalidRequest::AlreadyComplete` on a second completion.
    pub fn complete(
        &mut self,
        handle: MafHandle,
        data: Option<Box<BlockData>>,
        shared: bool,
        nxm: bool,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle.index())
            .filter(|e| e.valid)
            .ok_or(InvalidRequest::StaleHandle(handle.0))?;
        if entry.complete {
            return Err(InvalidRequest::AlreadyComplete(handle.0).into());
        }
        entry.complete = true;
        entry.shared = shared;
        entry.fill = data;
        entry.nxm = nxm;
        Ok(())
    }

    /// Hands a completed entry to the pipeline and frees the slot.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the slot is unused or not yet complete;
    /// `NonExistentMemory` if the hub found no memory behind the address
    /// (the slot is still freed).
    pub fn consume(&mut self, handle: MafHandle) -> Result<MafCompletion> {
        let entry = self
            .entries
            .get_mut(handle.index())
            .filter(|e| e.valid)
            .ok_or(InvalidRequest::StaleHandle(handle.0))?;
        if !entry.complete {
            return Err(InvalidRequest::NotComplete(handle.0).into());
        }
        let entry = std::mem::take(entry);
        trace!(slot = handle.index(), addr = %entry.addr, "maf free");
        if entry.nxm {
            return Err(CoherenceError::NonExistentMemory(entry.addr.val()));
        }
        Ok(MafCompletion {
            kind: entry.kind.unwrap_or(MafType::MemoryBarrier),
            addr: entry.addr,
            data: entry.fill,
            shared: entry.shared,
            lsq_refs: entry.lsq_refs,
        })
    }

    /// Iterates over occupied slots.
    pub fn iter_live(&self) -> impl Iterator<Item = (MafHandle, &MafEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.valid)
            .map(|(i, e)| (MafHandle(i as u8), e))
    }
}
