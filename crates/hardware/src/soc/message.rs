//! Messages exchanged between a CPU's Cbox and the coherence hub.
//!
//! 1. **CPU to hub (`SysRequest`):** Block reads, I/O writes, victim writebacks,
//!    probe responses, and memory barriers, queued in the CPU's outbound FIFO.
//! 2. **Hub to CPU (`SysMessage`):** Either a data transfer completing one of the
//!    CPU's requests or a probe for the CPU's probe ring.

use crate::cbox::probe::{Probe, ProbeResponse};
use crate::cbox::victim::VictimHandle;
use crate::common::{BlockData, PhysAddr, RequestId};

/// How a read request wants the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadKind {
    /// Read for a load or instruction fetch; other copies may survive.
    Shared,
    /// Read with intent to modify; every other copy is invalidated.
    Modify,
    /// Upgrade a clean local copy; other copies are invalidated and only
    /// dirty data moves.
    ChangeToDirty,
    /// Claim a whole block that is about to be overwritten; no data moves.
    Wh64,
}

impl ReadKind {
    /// `true` if the fill grants ownership.
    #[inline]
    pub const fn exclusive(self) -> bool {
        !matches!(self, Self::Shared)
    }
}

/// Request sent from a Cbox to the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SysRequest {
    /// Read a block (MAF slot `id`).
    Read {
        /// Completion id.
        id: RequestId,
        /// Requested address.
        addr: PhysAddr,
        /// Requested ownership.
        kind: ReadKind,
    },
    /// Write buffered I/O-space bytes (IOWB slot `id`).
    IoWrite {
        /// Completion id.
        id: RequestId,
        /// First byte written.
        addr: PhysAddr,
        /// Bytes starting at `addr`.
        data: Vec<u8>,
        /// Lane mask.
        mask: u8,
        /// Block bytes to store; the others in `data` are left untouched.
        written: u64,
    },
    /// Write a dirty block back to memory.
    Victim {
        /// Victim slot to acknowledge.
        handle: VictimHandle,
        /// Block address.
        addr: PhysAddr,
        /// Block contents.
        data: Box<BlockData>,
    },
    /// Answer to a probe.
    ProbeResponse(ProbeResponse),
    /// Memory barrier (MAF slot `id`); completes once everything queued before it was accepted.
    MemoryBarrier {
        /// Completion id.
        id: RequestId,
    },
}

/// What a data transfer completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompletionTarget {
    /// A MAF or IOWB slot.
    Request(RequestId),
    /// A victim slot whose transfer the hub accepted.
    Victim(VictimHandle),
}

/// Data transfer from the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Slot being completed.
    pub target: CompletionTarget,
    /// Block contents for reads.
    pub data: Option<Box<BlockData>>,
    /// Another CPU kept a copy.
    pub shared: bool,
    /// No memory array backs the address.
    pub nxm: bool,
}

impl Completion {
    /// Completion for a MAF or IOWB slot.
    pub const fn request(id: RequestId, data: Option<Box<BlockData>>, shared: bool) -> Self {
        Self {
            target: CompletionTarget::Request(id),
            data,
            shared,
            nxm: false,
        }
    }

    /// Non-existent-memory completion for a MAF slot.
    pub const fn nonexistent(id: RequestId) -> Self {
        Self {
            target: CompletionTarget::Request(id),
            data: None,
            shared: false,
            nxm: true,
        }
    }

    /// Acknowledgement of a victim transfer.
    pub const fn victim(handle: VictimHandle) -> Self {
        Self {
            target: CompletionTarget::Victim(handle),
            data: None,
            shared: false,
            nxm: false,
        }
    }
}

/// Message delivered by the hub to a CPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SysMessage {
    /// Completion of an earlier request.
    DataTransfer(Completion),
    /// Probe for the CPU's probe ring.
    Probe(Probe),
}
