//! I/O Write Buffer (IOWB).
//!
//! Small stores to I/O space are collected into block-sized transactions:
//! 1. **Merge:** A store joins an unissued entry with the same store length in the same block.
//! 2. **Allocate:** Otherwise it takes a free (or already processed) slot.
//! 3. **Issue:** Pending entries are handed to the chipset as one write each.
//! 4. **Complete:** The chipset's acknowledgement marks the entry processed.

use tracing::trace;

use crate::cbox::maf::AccessWidth;
use crate::common::constants::{IOWB_ENTRIES, MBOX_MAX};
use crate::common::data::{byte_mask, zero_block};
use crate::common::{
    BlockData, CoherenceError, InvalidRequest, LsqRef, LsqRefs, PhysAddr, RequestId, Resource,
    Result,
};

/// Index of an IOWB slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IowbHandle(pub(crate) u8);

impl IowbHandle {
    /// Slot index.
    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Request id naming this slot in hub completions.
    #[inline]
    pub const fn request_id(&self) -> RequestId {
        RequestId::iowb(self.0 as usize)
    }
}

/// One IOWB slot.
#[derive(Clone, Debug)]
pub struct IowbEntry {
    /// Block image; only the bytes set in `written` are meaningful.
    pub data: BlockData,
    /// Lowest buffered address.
    pub addr: PhysAddr,
    /// Bytes covered from `addr`.
    pub buf_len: usize,
    /// Length of each merged store.
    pub store_len: usize,
    /// 8-bit lane mask accumulated over every merged store.
    pub mask: u8,
    /// One bit per block byte actually stored to.
    pub written: u64,
    /// Load/store-queue slots waiting on this entry.
    pub lsq_refs: LsqRefs,
    /// The chipset acknowledged the write.
    pub processed: bool,
    /// Slot occupied.
    pub valid: bool,
    issued: bool,
}

impl Default for IowbEntry {
    fn default() -> Self {
        Self {
            data: zero_block(),
            addr: PhysAddr::default(),
            buf_len: 0,
            store_len: 0,
            mask: 0,
            written: 0,
            lsq_refs: LsqRefs::new(),
            processed: false,
            valid: false,
            issued: false,
        }
    }
}

impl IowbEntry {
    /// `true` while new stores may still merge in.
    #[inline]
    pub const fn mergeable(&self) -> bool {
        self.valid && !self.processed && !self.issued
    }

    /// `true` once handed to the chipset.
    #[inline]
    pub const fn issued(&self) -> bool {
        self.issued
    }

    /// The buffered span from `addr`; bytes outside `written` are filler.
    pub fn payload(&self) -> &[u8] {
        let start = self.addr.block_offset();
        &self.data[start..start + self.buf_len]
    }
}

/// Fixed-capacity I/O write buffer.
#[derive(Debug)]
pub struct IoWriteBuffer {
    entries: Vec<IowbEntry>,
}

impl Default for IoWriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl IoWriteBuffer {
    /// Creates an empty buffer with `IOWB_ENTRIES` slots.
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(IOWB_ENTRIES);
        entries.resize_with(IOWB_ENTRIES, IowbEntry::default);
        Self { entries }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Returns the occupied entry behind `handle`.
    pub fn get(&self, handle: IowbHandle) -> Option<&IowbEntry> {
        self.entries.get(handle.index()).filter(|e| e.valid)
    }

    /// Number of occupied, unprocessed slots.
    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.valid && !e.processed)
            .count()
    }

    /// Buffers a store, merging when possible. Returns the slot and `true` for a merge.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an unsupported store length, data that does not
    /// match it, a misaligned address, a store crossing a block boundary, or
    /// too many references. `ResourceExhausted` when no merge is possible and
    /// every slot is in use.
    pub fn allocate(
        &mut self,
        addr: PhysAddr,
        data: &[u8],
        mask: u8,
        store_len: usize,
        refs: &[LsqRef],
    ) -> Result<(IowbHandle, bool)> {
        let width = AccessWidth::from_bytes(store_len)?;
        if data.len() != store_len {
            return Err(InvalidRequest::StoreLength(data.len()).into());
        }
        if !addr.fits_in_block(store_len) {
            return Err(InvalidRequest::SpansBlock {
                addr,
                len: store_len,
            }
            .into());
        }
        if !addr.is_aligned(width.bytes() as u64) {
            return Err(InvalidRequest::Misaligned {
                addr,
                align: width.bytes() as u64,
            }
            .into());
        }
        if refs.len() > MBOX_MAX {
            return Err(InvalidRequest::TooManyRefs(refs.len()).into());
        }

        let offset = addr.block_offset();
        let merge_target = self.entries.iter().position(|e| {
            e.mergeable()
                && e.store_len == store_len
                && e.addr.block() == addr.block()
                && e.lsq_refs.len() + refs.len() <= MBOX_MAX
        });

        if let Some(index) = merge_target {
            let entry = &mut self.entries[index];
            let start = entry.addr.val().min(addr.val());
            let end = (entry.addr.val() + entry.buf_len as u64).max(addr.val() + store_len as u64);
            entry.data[offset..offset + store_len].copy_from_slice(data);
            entry.addr = PhysAddr::new(start);
            entry.buf_len = (end - start) as usize;
            entry.mask |= mask;
            entry.written |= byte_mask(offset, store_len);
            entry.lsq_refs.extend_from_slice(refs);
            trace!(slot = index, %addr, mask = entry.mask, "iowb merge");
            return Ok((IowbHandle(index as u8), true));
        }

        let index = self
            .entries
            .iter()
            .position(|e| !e.valid || e.processed)
            .ok_or(CoherenceError::exhausted(Resource::IoWriteBuffer))?;
        let mut entry = IowbEntry {
            addr,
            buf_len: store_len,
            store_len,
            mask,
            written: byte_mask(offset, store_len),
            lsq_refs: refs.iter().copied().collect(),
            valid: true,
            ..IowbEntry::default()
        };
        entry.data[offset..offset + store_len].copy_from_slice(data);
        self.entries[index] = entry;
        trace!(slot = index, %addr, mask, "iowb allocate");
        Ok((IowbHandle(index as u8), false))
    }

    /// Marks every unissued entry as issued and returns them in slot order.
    pub fn issue_pending(&mut self) -> Vec<IowbHandle> {
        let mut issued = Vec::new();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.mergeable() {
                entry.issued = true;
                issued.push(IowbHandle(i as u8));
            }
        }
        issued
    }

    /// Records the chipset's acknowledgement; the slot becomes reusable.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the slot is unused or already processed.
    pub fn complete(&mut self, handle: IowbHandle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle.index())
            .filter(|e| e.valid)
            .ok_or(InvalidRequest::StaleHandle(handle.0))?;
        if entry.processed {
            return Err(InvalidRequest::AlreadyComplete(handle.0).into());
        }
        entry.processed = true;
        Ok(())
    }
}
