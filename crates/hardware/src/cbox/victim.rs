//! Victim buffer (paired victim address file and victim data file).
//!
//! Eight slots hold cache blocks on their way out of the CPU:
//! 1. **Primary-cache victims** headed for the backup cache.
//! 2. **Backup-cache victims** headed for memory.
//! 3. **Probe responses** carrying dirty data back to the chipset.
//!
//! A slot that is still draining (`valid && !processed`) is never chosen as a
//! new victim target; only free or already-processed slots are reused.

use tracing::trace;

use crate::common::constants::VICTIM_ENTRIES;
use crate::common::data::zero_block;
use crate::common::{BlockData, CoherenceError, InvalidRequest, PhysAddr, Resource, Result};

/// Where a victim is headed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VictimDisposition {
    /// Primary-cache block written into the backup cache.
    ToBcache,
    /// Block written back to memory.
    ToMemory,
    /// Dirty block returned to the chipset for a probe.
    ProbeResponse,
}

/// Index of a victim buffer slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VictimHandle(pub(crate) u8);

impl VictimHandle {
    /// Slot index.
    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// One victim address/data pair.
#[derive(Clone, Debug)]
pub struct VictimEntry {
    /// Block contents.
    pub data: BlockData,
    /// Block address.
    pub addr: PhysAddr,
    /// Destination; `None` while the slot is unused.
    pub disposition: Option<VictimDisposition>,
    /// A destination has been chosen.
    pub valid_victim: bool,
    /// The payload answers a probe.
    pub valid_probe: bool,
    /// Transfer finished; the slot may be reclaimed.
    pub processed: bool,
    /// Slot occupied.
    pub valid: bool,
    /// Selected for transfer in the current step.
    pub marked: bool,
}

impl Default for VictimEntry {
    fn default() -> Self {
        Self {
            data: zero_block(),
            addr: PhysAddr::default(),
            disposition: None,
            valid_victim: false,
            valid_probe: false,
            processed: false,
            valid: false,
            marked: false,
        }
    }
}

impl VictimEntry {
    /// `true` while the slot holds data that has not finished its transfer.
    #[inline]
    pub const fn draining(&self) -> bool {
        self.valid && !self.processed
    }
}

/// Fixed-capacity victim buffer.
#[derive(Debug)]
pub struct VictimBuffer {
    entries: Vec<VictimEntry>,
}

impl Default for VictimBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl VictimBuffer {
    /// Creates an empty buffer with `VICTIM_ENTRIES` slots.
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(VICTIM_ENTRIES);
        entries.resize_with(VICTIM_ENTRIES, VictimEntry::default);
        Self { entries }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of slots still draining.
    pub fn draining(&self) -> usize {
        self.entries.iter().filter(|e| e.draining()).count()
    }

    /// Returns `true` if an allocation would succeed right now.
    pub fn has_room(&self) -> bool {
        self.entries.iter().any(|e| !e.draining())
    }

    /// Returns the occupied entry behind `handle`.
    pub fn get(&self, handle: VictimHandle) -> Option<&VictimEntry> {
        self.entries.get(handle.index()).filter(|e| e.valid)
    }

    /// Places a block in the buffer.
    ///
    /// Free slots are preferred; with none free, a processed slot is reclaimed.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when every slot is still draining. This is
    /// backpressure: retry once the chipset acknowledges a transfer.
    pub fn allocate(
        &mut self,
        addr: PhysAddr,
        data: &BlockData,
        disposition: VictimDisposition,
    ) -> Result<VictimHandle> {
        let index = self
            .entries
            .iter()
            .position(|e| !e.valid)
            .or_else(|| self.entries.iter().position(|e| e.valid && e.processed))
            .ok_or(CoherenceError::exhausted(Resource::VictimBuffer))?;

        self.entries[index] = VictimEntry {
            data: *data,
            addr: addr.block(),
            disposition: Some(disposition),
            valid_victim: true,
            valid_probe: disposition == VictimDisposition::ProbeResponse,
            processed: false,
            valid: true,
            marked: false,
        };
        trace!(slot = index, %addr, ?disposition, "victim allocate");
        Ok(VictimHandle(index as u8))
    }

    /// Selects every draining, unselected entry headed for `disposition` and
    /// marks it as in transfer. Returns the selected slots in slot order.
    pub fn mark_for_transfer(&mut self, disposition: VictimDisposition) -> Vec<VictimHandle> {
        let mut selected = Vec::new();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.draining() && !entry.marked && entry.disposition == Some(disposition) {
                entry.marked = true;
                selected.push(VictimHandle(i as u8));
            }
        }
        selected
    }

    /// Records that the transfer out of `handle` finished.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::StaleHandle` if the slot is not occupied.
    pub fn complete_transfer(&mut self, handle: VictimHandle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle.index())
            .filter(|e| e.valid)
            .ok_or(InvalidRequest::StaleHandle(handle.0))?;
        entry.processed = true;
        entry.marked = false;
        Ok(())
    }

    /// Frees a slot.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::StaleHandle` if the slot is not occupied.
    pub fn release(&mut self, handle: VictimHandle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle.index())
            .filter(|e| e.valid)
            .ok_or(InvalidRequest::StaleHandle(handle.0))?;
        *entry = VictimEntry::default();
        Ok(())
    }

    /// Finds a draining entry holding the block that contains `addr`.
    pub fn find_draining(&self, addr: PhysAddr) -> Option<VictimHandle> {
        self.entries
            .iter()
            .position(|e| e.draining() && e.addr == addr.block())
            .map(|i| VictimHandle(i as u8))
    }
}
